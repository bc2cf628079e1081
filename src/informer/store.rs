//! Thread-safe keyed cache with pluggable secondary indexes. One lock guards
//! the objects, the indexer functions and the index maps together; readers
//! always copy out, nothing aliasing the interior ever escapes.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use thiserror::Error;

use crate::informer::Event;
use crate::schema::Resource;

/// Maps an object to the index keys it should be reachable under.
pub type IndexFn<T> = Box<dyn Fn(&T) -> Vec<String> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("indexer {0} already registered")]
    IndexerExists(String),
    #[error("cannot add indexer {0}: store already receives live updates")]
    Started(String),
}

pub struct IndexedStore<T> {
    inner: RwLock<Inner<T>>,
}

struct Inner<T> {
    objects: HashMap<String, T>,
    indexers: HashMap<String, IndexFn<T>>,
    // index name -> index key -> primary keys
    indices: HashMap<String, HashMap<String, HashSet<String>>>,
    // set once the first watch event lands; indexer registration is
    // rejected from then on
    live: bool,
}

impl<T: Resource> Default for IndexedStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> IndexedStore<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                objects: HashMap::new(),
                indexers: HashMap::new(),
                indices: HashMap::new(),
                live: false,
            }),
        }
    }

    /// Registers a secondary index. Existing contents are backfilled, but
    /// registration fails once live watch updates have been applied.
    pub fn add_indexer(&self, name: &str, index_fn: IndexFn<T>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.live {
            return Err(StoreError::Started(name.to_string()));
        }
        if inner.indexers.contains_key(name) {
            return Err(StoreError::IndexerExists(name.to_string()));
        }

        let mut index: HashMap<String, HashSet<String>> = HashMap::new();
        for (key, obj) in &inner.objects {
            for index_key in index_fn(obj) {
                index.entry(index_key).or_default().insert(key.clone());
            }
        }
        inner.indices.insert(name.to_string(), index);
        inner.indexers.insert(name.to_string(), index_fn);
        Ok(())
    }

    /// Inserts or replaces one object, returning the previous version.
    /// Marks the store live: this path is only taken by watch events.
    pub fn upsert(&self, obj: T) -> Option<T> {
        let mut inner = self.inner.write().unwrap();
        inner.live = true;
        inner.apply(obj)
    }

    /// Removes one object, returning it if it was present. Marks the store
    /// live like `upsert`.
    pub fn delete(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.write().unwrap();
        inner.live = true;
        inner.remove(key)
    }

    /// Atomically replaces the full contents with `objects` (list phase).
    /// Returns the per-key events the replacement amounts to, in a stable
    /// order: deletes for vanished keys, then adds/updates for the rest.
    pub fn replace(&self, objects: Vec<T>) -> Vec<Event<T>> {
        let mut inner = self.inner.write().unwrap();

        let new_keys: HashSet<&str> = objects.iter().map(|obj| obj.id()).collect();
        let gone: Vec<String> = inner
            .objects
            .keys()
            .filter(|key| !new_keys.contains(key.as_str()))
            .cloned()
            .collect();

        let mut events = Vec::with_capacity(gone.len() + objects.len());
        for key in gone {
            if let Some(old) = inner.remove(&key) {
                events.push(Event::Deleted(old));
            }
        }
        for obj in objects {
            match inner.apply(obj.clone()) {
                Some(old) => events.push(Event::Updated(old, obj)),
                None => events.push(Event::Added(obj)),
            }
        }
        events
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.inner.read().unwrap().objects.get(key).cloned()
    }

    /// Snapshot of all objects. No ordering is guaranteed.
    pub fn list(&self) -> Vec<T> {
        self.inner.read().unwrap().objects.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects whose indexer output for `name` included `index_key`.
    pub fn by_index(&self, name: &str, index_key: &str) -> Vec<T> {
        let inner = self.inner.read().unwrap();
        inner
            .index_entry(name, index_key)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| inner.objects.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Primary keys of matching objects, without materializing them.
    pub fn index_keys(&self, name: &str, index_key: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .index_entry(name, index_key)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl<T: Resource> Inner<T> {
    fn index_entry(&self, name: &str, index_key: &str) -> Option<&HashSet<String>> {
        self.indices.get(name).and_then(|index| index.get(index_key))
    }

    fn apply(&mut self, obj: T) -> Option<T> {
        let key = obj.id().to_string();
        let old = self.objects.insert(key.clone(), obj);
        if let Some(ref old) = old {
            self.unindex(&key, old);
        }
        let obj = &self.objects[&key];
        for (name, index_fn) in &self.indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for index_key in index_fn(obj) {
                index.entry(index_key).or_default().insert(key.clone());
            }
        }
        old
    }

    fn remove(&mut self, key: &str) -> Option<T> {
        let old = self.objects.remove(key)?;
        self.unindex(key, &old);
        Some(old)
    }

    fn unindex(&mut self, key: &str, old: &T) {
        for (name, index_fn) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for index_key in index_fn(old) {
                if let Some(keys) = index.get_mut(&index_key) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&index_key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{label, vm};

    fn vnic_indexer() -> IndexFn<crate::schema::VirtualMachine> {
        Box::new(|vm| vm.vnics.iter().map(|vnic| vnic.meta.id.clone()).collect())
    }

    #[test]
    fn index_tracks_upserts_and_deletes() {
        let store = IndexedStore::new();
        store.add_indexer("vnic", vnic_indexer()).unwrap();

        store.upsert(vm("vm-1", &["vnic-a", "vnic-b"]));
        store.upsert(vm("vm-2", &["vnic-c"]));

        assert_eq!(store.index_keys("vnic", "vnic-a"), vec!["vm-1"]);
        assert_eq!(store.by_index("vnic", "vnic-c")[0].meta.id, "vm-2");

        // interface moves to another vm
        store.upsert(vm("vm-1", &["vnic-b"]));
        store.upsert(vm("vm-2", &["vnic-a", "vnic-c"]));
        assert_eq!(store.index_keys("vnic", "vnic-a"), vec!["vm-2"]);

        store.delete("vm-2");
        assert!(store.index_keys("vnic", "vnic-a").is_empty());
        assert!(store.by_index("vnic", "vnic-c").is_empty());
        assert_eq!(store.index_keys("vnic", "vnic-b"), vec!["vm-1"]);
    }

    #[test]
    fn indexer_backfills_existing_objects() {
        let store = IndexedStore::new();
        store.replace(vec![vm("vm-1", &["vnic-a"]), vm("vm-2", &["vnic-b"])]);

        store.add_indexer("vnic", vnic_indexer()).unwrap();
        assert_eq!(store.index_keys("vnic", "vnic-b"), vec!["vm-2"]);
    }

    #[test]
    fn indexer_rejected_once_live() {
        let store = IndexedStore::new();
        store.upsert(vm("vm-1", &["vnic-a"]));

        let err = store.add_indexer("vnic", vnic_indexer()).unwrap_err();
        assert_eq!(err, StoreError::Started("vnic".to_string()));
    }

    #[test]
    fn duplicate_indexer_rejected() {
        let store = IndexedStore::<crate::schema::VirtualMachine>::new();
        store.add_indexer("vnic", vnic_indexer()).unwrap();
        let err = store.add_indexer("vnic", vnic_indexer()).unwrap_err();
        assert_eq!(err, StoreError::IndexerExists("vnic".to_string()));
    }

    #[test]
    fn replace_reports_the_diff() {
        let store = IndexedStore::new();
        store.replace(vec![label("l1", "tier", Some("web"), &["vm-1"])]);

        let events = store.replace(vec![
            label("l1", "tier", Some("db"), &["vm-1"]),
            label("l2", "env", Some("prod"), &["vm-1"]),
        ]);

        let mut added = 0;
        let mut updated = 0;
        for event in &events {
            match event {
                Event::Added(new) => {
                    added += 1;
                    assert_eq!(new.meta.id, "l2");
                }
                Event::Updated(old, new) => {
                    updated += 1;
                    assert_eq!(old.value.as_deref(), Some("web"));
                    assert_eq!(new.value.as_deref(), Some("db"));
                }
                Event::Deleted(_) => panic!("no deletes expected"),
            }
        }
        assert_eq!((added, updated), (1, 1));

        let events = store.replace(vec![label("l2", "env", Some("prod"), &["vm-1"])]);
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::Deleted(old) if old.meta.id == "l1")));
        assert_eq!(store.len(), 1);
    }
}
