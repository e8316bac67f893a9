//! Crate with the runtime components of the cluster operator
//!
//! This crate contains the building blocks that keep a reconciler fed: a recovering
//! [`watcher`], an in-memory [`reflector`] cache with tombstones, a deduplicating and
//! rate limited [`workqueue`], and the [`Controller`] that wires them to a pool of workers.
//!
//! Nothing in here knows about `ClusterRequest`; it works for any namespaced kind.

pub mod controller;
pub mod predicate;
pub mod reflector;
pub mod watcher;
pub mod workqueue;

pub use controller::{Action, ApiLookup, Controller, Lookup, Target};
pub use reflector::{ObjectKey, Store};
pub use watcher::watcher;
pub use workqueue::{RetryPolicy, WorkQueue};
