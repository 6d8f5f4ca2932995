//! In-memory value storage with copy-in/copy-out semantics.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

/// Values owned by this node, keyed by their 40 character hex content
/// hash. Bytes are copied on the way in and on the way out so no caller
/// or wire buffer ever aliases the stored data.
#[derive(Debug, Default)]
pub struct ValueStore {
    values: RwLock<HashMap<String, Vec<u8>>>,
}

impl ValueStore {
    pub fn new() -> Self {
        ValueStore::default()
    }

    /// Store an owned copy of `value` under `key`.
    pub fn store(&self, key: &str, value: &[u8]) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_vec());
    }

    /// Load a fresh copy of the value stored under `key`, if any.
    pub fn load(&self, key: &str) -> Option<Vec<u8>> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keys this node authored via its own put; only these are republished.
/// Locked independently of the value store.
#[derive(Debug, Default)]
pub struct OriginSet {
    keys: RwLock<HashSet<String>>,
}

impl OriginSet {
    pub fn new() -> Self {
        OriginSet::default()
    }

    pub fn insert(&self, key: &str) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Copy of the current key set, taken under the read lock and
    /// released before any value is touched.
    pub fn snapshot(&self) -> Vec<String> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
