//! Filters out notifications that do not change what a reconciler would do
use crate::reflector::ObjectKey;
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
};

fn hash<T: Hash + ?Sized>(t: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    t.hash(&mut hasher);
    hasher.finish()
}

/// A predicate is a hasher of the properties of an object that a reconciler cares about
pub trait Predicate<K> {
    /// A predicate only needs to implement optional hashing when keys exist
    fn hash_property(&self, obj: &K) -> Option<u64>;

    /// Returns a `Predicate` that combines all available hashes
    fn combine<F: Predicate<K>>(self, f: F) -> Combine<Self, F>
    where
        Self: Sized,
    {
        Combine(self, f)
    }
}

impl<K, F: Fn(&K) -> Option<u64>> Predicate<K> for F {
    fn hash_property(&self, obj: &K) -> Option<u64> {
        (self)(obj)
    }
}

/// See [`Predicate::combine`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Combine<A, B>(A, B);
impl<A, B, K> Predicate<K> for Combine<A, B>
where
    A: Predicate<K>,
    B: Predicate<K>,
{
    fn hash_property(&self, obj: &K) -> Option<u64> {
        match (self.0.hash_property(obj), self.1.hash_property(obj)) {
            (None, None) => None,
            (a, b) => Some(hash(&(a, b))),
        }
    }
}

/// Predicate functions for [`ChangeFilter`]
pub mod predicates {
    use super::hash;
    use kube::Resource;

    /// Hash the generation of a Resource K
    pub fn generation<K: Resource>(obj: &K) -> Option<u64> {
        obj.meta().generation.map(|g| hash(&g))
    }

    /// Hash whether deletion of a Resource K has been requested
    pub fn deletion<K: Resource>(obj: &K) -> Option<u64> {
        Some(hash(&obj.meta().deletion_timestamp.is_some()))
    }
}

/// Remembers the last forwarded predicate value per object
///
/// Objects whose predicate cannot be evaluated are always forwarded.
#[derive(Debug)]
pub struct ChangeFilter<P> {
    predicate: P,
    cache: HashMap<ObjectKey, u64>,
}

impl<P> ChangeFilter<P> {
    /// Creates a filter with an empty cache
    pub fn new(predicate: P) -> Self {
        Self {
            predicate,
            cache: HashMap::new(),
        }
    }

    /// Whether `obj` should be forwarded, recording its predicate value if so
    pub fn changed<K>(&mut self, key: &ObjectKey, obj: &K) -> bool
    where
        P: Predicate<K>,
    {
        let Some(val) = self.predicate.hash_property(obj) else {
            return true;
        };
        if self.cache.get(key) == Some(&val) {
            return false;
        }
        self.cache.insert(key.clone(), val);
        true
    }

    /// Drops the cached value for a deleted object
    pub fn forget(&mut self, key: &ObjectKey) {
        self.cache.remove(key);
    }
}
