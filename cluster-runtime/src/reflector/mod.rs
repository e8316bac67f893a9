//! Caches objects in memory
//!
//! The [`Writer`] is owned by the single task consuming the watch stream, any number of
//! [`Store`] readers may be handed out to workers.

mod object_key;
pub mod store;

pub use self::{
    object_key::ObjectKey,
    store::{Change, Store, Writer},
};

/// Creates a (Store, Writer) pair for objects of kind `K`
#[must_use]
pub fn store<K: kube::Resource + Clone>() -> (Store<K>, Writer<K>) {
    let writer = Writer::default();
    (writer.as_reader(), writer)
}
