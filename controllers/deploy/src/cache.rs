//! Local mirror of the watched collection.
//!
//! Written only by the watcher; read concurrently by anyone holding a clone.

use crate::event::ReconcileKey;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Shared, keyed snapshot store of the watched objects.
#[derive(Debug)]
pub struct ObjectCache<K> {
    objects: Arc<RwLock<HashMap<ReconcileKey, Arc<K>>>>,
}

impl<K> Clone for ObjectCache<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K> ObjectCache<K> {
    /// Cached snapshot for `key`, if any.
    pub fn get(&self, key: &ReconcileKey) -> Option<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Store `obj`, returning the snapshot it replaces.
    pub(crate) fn insert(&self, key: ReconcileKey, obj: Arc<K>) -> Option<Arc<K>> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, obj)
    }

    pub(crate) fn remove(&self, key: &ReconcileKey) -> Option<Arc<K>> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Drop every entry whose key is not in `keep`, returning what was dropped.
    pub(crate) fn retain_keys(&self, keep: &std::collections::HashSet<ReconcileKey>) -> Vec<Arc<K>> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<ReconcileKey> = objects
            .keys()
            .filter(|key| !keep.contains(*key))
            .cloned()
            .collect();
        stale
            .iter()
            .filter_map(|key| objects.remove(key))
            .collect()
    }

    /// Point-in-time copy of every cached object.
    pub fn snapshot(&self) -> Vec<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the cache holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
