//! Durable backend over a single fjall partition.
//!
//! The tagged key space maps onto one partition, so the whole chain store
//! shares one journal and one write path.

use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{tagged, Backend, Batch, StoreError, Table};

const PARTITION: &str = "chain";

pub struct FjallStore {
    keyspace: Keyspace,
    data: PartitionHandle,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_config(Config::new(path))
    }

    pub fn open_with_config(config: Config) -> Result<Self, StoreError> {
        let keyspace = config
            .open()
            .map_err(|err| StoreError::backend("keyspace", err.to_string()))?;
        let data = keyspace
            .open_partition(PARTITION, PartitionCreateOptions::default())
            .map_err(|err| StoreError::backend(PARTITION, err.to_string()))?;
        Ok(Self { keyspace, data })
    }
}

impl Backend for FjallStore {
    fn read(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .data
            .get(tagged(table, key))
            .map_err(|err| StoreError::backend(table.name(), err.to_string()))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn scan(
        &self,
        table: Table,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), StoreError> {
        for entry in self.data.prefix(tagged(table, prefix)) {
            let (key, value) =
                entry.map_err(|err| StoreError::backend(table.name(), err.to_string()))?;
            if !visit(&key[1..], value.as_ref()) {
                break;
            }
        }
        Ok(())
    }

    fn apply(&self, batch: Batch) -> Result<(), StoreError> {
        let mut writes = self.keyspace.batch();
        for (key, value) in batch.into_entries() {
            match value {
                Some(value) => writes.insert(&self.data, key, value),
                None => writes.remove(&self.data, key),
            }
        }
        writes
            .commit()
            .map_err(|err| StoreError::backend("batch", err.to_string()))
    }

    fn persist(&self) -> Result<(), StoreError> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|err| StoreError::backend("persist", err.to_string()))
    }
}
