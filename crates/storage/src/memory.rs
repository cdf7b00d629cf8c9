//! In-memory backend used by tests and tooling.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::{tagged, Backend, Batch, StoreError, Table};

/// One ordered map over the tagged key space.
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryStore {
    fn read(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.map.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(&tagged(table, key)).cloned())
    }

    fn scan(
        &self,
        table: Table,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), StoreError> {
        let map = self.map.read().map_err(|_| StoreError::Poisoned)?;
        let start = tagged(table, prefix);
        let range = map.range::<Vec<u8>, _>((Bound::Included(start.clone()), Bound::Unbounded));
        for (key, value) in range {
            if !key.starts_with(&start) {
                break;
            }
            if !visit(&key[1..], value) {
                break;
            }
        }
        Ok(())
    }

    fn apply(&self, batch: Batch) -> Result<(), StoreError> {
        let mut map = self.map.write().map_err(|_| StoreError::Poisoned)?;
        for (key, value) in batch.into_entries() {
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}
