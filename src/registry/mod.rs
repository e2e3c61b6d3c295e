//! Thread-safe keyed object registries.
//!
//! [`KeyedRegistry`] is the one "name/id → object" store the engine uses for
//! every shared lookup table: the plugin catalog, the active-sub-pipeline
//! table, the hosted pipeline/job maps of the execution server and its peer
//! list. The hierarchical log-channel registry builds its own adjacency on
//! the same locking discipline.
//!
//! # Synchronization
//!
//! Every mutation and every snapshot-producing read goes through the same
//! `RwLock`. The backing map never leaves the lock: `list`, `list_keys` and
//! `entries` copy out a point-in-time view, ordered by registration, so a
//! caller can iterate while other threads keep registering.

pub mod logging;
pub mod plugin;
pub mod subpipeline;

pub use logging::{LogChannelRegistry, LogLevel, LoggingObject, LoggingObjectType, LoggingSource};
pub use plugin::{PluginCatalog, PluginCatalogListener, PluginDescriptor, PluginType};
pub use subpipeline::{ActiveSubPipelines, SubPipelineHandle, SubPipelineState};

use crate::error::{EngineError, Result};
use parking_lot::RwLock;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// What `register` does when the key is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterPolicy {
    /// Refuse with [`EngineError::DuplicateKey`]; the caller must remove first.
    RejectDuplicates,
    /// Atomically supersede the previous value (last writer wins).
    ReplaceExisting,
}

struct Entry<V> {
    seq: u64,
    value: V,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    next_seq: u64,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn insert(&mut self, key: K, value: V) -> Option<V> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(key, Entry { seq, value })
            .map(|old| old.value)
    }

    /// Entries sorted by registration order.
    fn ordered(&self) -> Vec<(&K, &V)> {
        let mut items: Vec<_> = self.entries.iter().map(|(k, e)| (e.seq, k, &e.value)).collect();
        items.sort_unstable_by_key(|(seq, _, _)| *seq);
        items.into_iter().map(|(_, k, v)| (k, v)).collect()
    }
}

/// Concurrent `key → value` store with a fixed duplicate policy.
///
/// Values are handed out by clone, so registries normally hold `Arc<T>`: a
/// reader keeps its reference even after the entry is replaced or removed.
pub struct KeyedRegistry<K, V> {
    name: &'static str,
    policy: RegisterPolicy,
    inner: RwLock<Inner<K, V>>,
}

impl<K, V> KeyedRegistry<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    /// Create an empty registry. `name` only appears in logs and errors.
    pub fn new(name: &'static str, policy: RegisterPolicy) -> Self {
        Self {
            name,
            policy,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> RegisterPolicy {
        self.policy
    }

    /// Value for `key`, or `None` if unknown.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.read().entries.get(key).map(|e| e.value.clone())
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.read().entries.contains_key(key)
    }

    /// Register `value` under `key`.
    ///
    /// Returns the superseded value under [`RegisterPolicy::ReplaceExisting`],
    /// or [`EngineError::DuplicateKey`] under
    /// [`RegisterPolicy::RejectDuplicates`] when the key is taken.
    pub fn register(&self, key: K, value: V) -> Result<Option<V>> {
        let mut inner = self.inner.write();
        if self.policy == RegisterPolicy::RejectDuplicates && inner.entries.contains_key(&key) {
            drop(inner);
            tracing::warn!("{}: rejected duplicate registration of {:?}", self.name, key);
            return Err(EngineError::DuplicateKey(format!("{}: {:?}", self.name, key)));
        }
        let previous = inner.insert(key, value);
        Ok(previous)
    }

    /// Register several entries as one step: either all of them become
    /// visible together, or (on a duplicate) none do.
    pub fn register_all(&self, entries: Vec<(K, V)>) -> Result<()> {
        let mut inner = self.inner.write();
        if self.policy == RegisterPolicy::RejectDuplicates {
            for (i, (key, _)) in entries.iter().enumerate() {
                let repeated = entries[..i].iter().any(|(k, _)| k == key);
                if repeated || inner.entries.contains_key(key) {
                    return Err(EngineError::DuplicateKey(format!("{}: {:?}", self.name, key)));
                }
            }
        }
        for (key, value) in entries {
            inner.insert(key, value);
        }
        Ok(())
    }

    /// Remove `key` if present. Unknown keys are a no-op.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.write().entries.remove(key).map(|e| e.value)
    }

    /// Remove every entry matching `predicate`, returning them in
    /// registration order.
    pub fn remove_where(&self, predicate: impl Fn(&K, &V) -> bool) -> Vec<(K, V)> {
        let mut inner = self.inner.write();
        let doomed: Vec<K> = inner
            .entries
            .iter()
            .filter(|&(k, e)| predicate(k, &e.value))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed: Vec<(u64, K, V)> = doomed
            .into_iter()
            .filter_map(|k| inner.entries.remove(&k).map(|e| (e.seq, k, e.value)))
            .collect();
        removed.sort_unstable_by_key(|(seq, _, _)| *seq);
        removed.into_iter().map(|(_, k, v)| (k, v)).collect()
    }

    /// Point-in-time copy of all values, in registration order.
    pub fn list(&self) -> Vec<V> {
        let inner = self.inner.read();
        inner.ordered().into_iter().map(|(_, v)| v.clone()).collect()
    }

    /// Point-in-time copy of all keys, in registration order.
    pub fn list_keys(&self) -> Vec<K> {
        let inner = self.inner.read();
        inner.ordered().into_iter().map(|(k, _)| k.clone()).collect()
    }

    /// Point-in-time copy of all entries, in registration order.
    pub fn entries(&self) -> Vec<(K, V)> {
        let inner = self.inner.read();
        inner
            .ordered()
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// First entry, in registration order, matching `predicate`.
    pub fn find(&self, predicate: impl Fn(&K, &V) -> bool) -> Option<(K, V)> {
        let inner = self.inner.read();
        inner
            .ordered()
            .into_iter()
            .find(|&(k, v)| predicate(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Drop every entry. Returns how many there were.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        let count = inner.entries.len();
        inner.entries.clear();
        count
    }
}

impl<K, V> fmt::Debug for KeyedRegistry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedRegistry")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("len", &self.inner.read().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reject_policy() {
        let reg = KeyedRegistry::new("catalog", RegisterPolicy::RejectDuplicates);
        assert_eq!(reg.register("a".to_string(), 1).unwrap(), None);
        let err = reg.register("a".to_string(), 2).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateKey(_)));
        assert_eq!(reg.get("a"), Some(1));

        reg.remove("a");
        assert_eq!(reg.register("a".to_string(), 3).unwrap(), None);
        assert_eq!(reg.get("a"), Some(3));
    }

    #[test]
    fn test_replace_policy() {
        let reg = KeyedRegistry::new("table", RegisterPolicy::ReplaceExisting);
        reg.register("x", Arc::new(1)).unwrap();
        let old_ref = reg.get("x").unwrap();
        let previous = reg.register("x", Arc::new(2)).unwrap();
        assert_eq!(previous.as_deref(), Some(&1));
        // A reference taken before the replace stays valid.
        assert_eq!(*old_ref, 1);
        assert_eq!(reg.get("x").as_deref(), Some(&2));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_unknown_keys_are_absent() {
        let reg: KeyedRegistry<String, u32> =
            KeyedRegistry::new("empty", RegisterPolicy::ReplaceExisting);
        assert_eq!(reg.get("nope"), None);
        assert_eq!(reg.remove("nope"), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_list_in_registration_order() {
        let reg = KeyedRegistry::new("ordered", RegisterPolicy::ReplaceExisting);
        for (i, key) in ["c", "a", "b"].into_iter().enumerate() {
            reg.register(key, i).unwrap();
        }
        assert_eq!(reg.list_keys(), vec!["c", "a", "b"]);
        assert_eq!(reg.list(), vec![0, 1, 2]);
        assert_eq!(reg.find(|_, v| *v > 0), Some(("a", 1)));
    }

    #[test]
    fn test_register_all_is_atomic() {
        let reg = KeyedRegistry::new("catalog", RegisterPolicy::RejectDuplicates);
        reg.register("b", 0).unwrap();
        assert!(reg.register_all(vec![("a", 1), ("b", 2)]).is_err());
        assert!(!reg.contains_key("a"));
        assert!(reg.register_all(vec![("c", 1), ("c", 2)]).is_err());
        assert!(reg.register_all(vec![("c", 1), ("d", 2)]).is_ok());
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_remove_where() {
        let reg = KeyedRegistry::new("ports", RegisterPolicy::ReplaceExisting);
        for i in 0..10 {
            reg.register(i, i * 10).unwrap();
        }
        let removed = reg.remove_where(|k, _| k % 2 == 0);
        assert_eq!(removed.len(), 5);
        assert_eq!(removed[0], (0, 0));
        assert_eq!(reg.len(), 5);
    }

    #[test]
    fn test_concurrent_register_and_list() {
        let reg = Arc::new(KeyedRegistry::new("stress", RegisterPolicy::RejectDuplicates));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    for i in 0..100 {
                        reg.register(format!("w{w}-{i}"), Arc::new(i)).unwrap();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let keys = reg.list_keys();
                        let unique: HashSet<_> = keys.iter().collect();
                        assert_eq!(unique.len(), keys.len());
                    }
                })
            })
            .collect();

        for h in writers.into_iter().chain(readers) {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 400);
    }
}
