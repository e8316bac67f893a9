use super::ObjectKey;
use crate::watcher;
use kube::Resource;
use parking_lot::RwLock;
use std::{collections::HashMap, fmt::Debug, sync::Arc};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug)]
struct Cache<K> {
    live: HashMap<ObjectKey, Arc<K>>,
    /// Last known state of objects that have been deleted
    tombstones: HashMap<ObjectKey, Arc<K>>,
}

impl<K> Default for Cache<K> {
    fn default() -> Self {
        Self {
            live: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }
}

impl<K> Cache<K> {
    fn apply(&mut self, key: ObjectKey, obj: Arc<K>) {
        self.tombstones.remove(&key);
        self.live.insert(key, obj);
    }

    fn delete(&mut self, key: ObjectKey, last_known: Arc<K>) {
        self.live.remove(&key);
        self.tombstones.insert(key, last_known);
    }
}

/// A change to the store caused by a single watcher event
#[derive(Debug, Clone)]
pub enum Change<K> {
    /// The object was added or modified
    Applied(ObjectKey, Arc<K>),
    /// The object was deleted, carries its last known state
    Deleted(ObjectKey, Arc<K>),
}

impl<K> Change<K> {
    /// The key of the changed object
    pub fn key(&self) -> &ObjectKey {
        match self {
            Change::Applied(key, _) | Change::Deleted(key, _) => key,
        }
    }
}

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple watchers.
/// In particular, `Restarted` events will clobber the state of other connected watchers.
#[derive(Debug)]
pub struct Writer<K> {
    store: Arc<RwLock<Cache<K>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl<K> Default for Writer<K> {
    fn default() -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            store: Arc::default(),
            ready_tx,
            ready_rx,
        }
    }
}

impl<K: Resource + Clone> Writer<K> {
    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: self.store.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }

    /// Applies a single watcher event to the store, returning the per-object changes
    ///
    /// Objects that were cached but are missing from a `Restarted` listing are reported as
    /// deleted, since their delete notifications were lost while the watch was down.
    /// The first `Restarted` event marks the store as ready.
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<K>) -> Vec<Change<K>> {
        let mut cache = self.store.write();
        let changes = match event {
            watcher::Event::Applied(obj) => {
                let key = ObjectKey::from_obj(obj);
                let obj = Arc::new(obj.clone());
                cache.apply(key.clone(), obj.clone());
                vec![Change::Applied(key, obj)]
            }
            watcher::Event::Deleted(obj) => {
                let key = ObjectKey::from_obj(obj);
                let obj = Arc::new(obj.clone());
                cache.delete(key.clone(), obj.clone());
                vec![Change::Deleted(key, obj)]
            }
            watcher::Event::Restarted(new_objs) => {
                let new_objs = new_objs
                    .iter()
                    .map(|obj| (ObjectKey::from_obj(obj), Arc::new(obj.clone())))
                    .collect::<HashMap<_, _>>();
                let vanished = cache
                    .live
                    .iter()
                    .filter(|(key, _)| !new_objs.contains_key(*key))
                    .map(|(key, obj)| (key.clone(), obj.clone()))
                    .collect::<Vec<_>>();
                let mut changes = Vec::with_capacity(new_objs.len() + vanished.len());
                for (key, obj) in vanished {
                    cache.delete(key.clone(), obj.clone());
                    changes.push(Change::Deleted(key, obj));
                }
                for (key, obj) in new_objs {
                    cache.apply(key.clone(), obj.clone());
                    changes.push(Change::Applied(key, obj));
                }
                changes
            }
        };
        drop(cache);
        if matches!(event, watcher::Event::Restarted(_)) {
            self.ready_tx.send_replace(true);
        }
        changes
    }
}

/// The writer was dropped before the store became ready
#[derive(Debug, Error)]
#[error("writer was dropped before store became ready")]
pub struct WriterDropped;

/// A readable cache of Kubernetes objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
#[derive(Debug)]
pub struct Store<K> {
    store: Arc<RwLock<Cache<K>>>,
    ready_rx: watch::Receiver<bool>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }
}

impl<K> Store<K> {
    /// The last known state of a deleted object
    #[must_use]
    pub fn tombstone(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.read().tombstones.get(key).cloned()
    }

    /// Forgets the last known state of a deleted object once its teardown is complete
    pub fn clear_tombstone(&self, key: &ObjectKey) {
        self.store.write().tombstones.remove(key);
    }

    /// Keys of all live objects
    #[must_use]
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.store.read().live.keys().cloned().collect()
    }

    /// Number of live objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().live.len()
    }

    /// Whether there are no live objects
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the initial listing to be applied
    ///
    /// # Errors
    /// Returns an error if the [`Writer`] was dropped before any listing arrived.
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        let mut ready_rx = self.ready_rx.clone();
        ready_rx.wait_for(|ready| *ready).await.map_err(|_| WriterDropped)?;
        Ok(())
    }
}
