//! First-spender index.
//!
//! Marks an outpoint with the input that consumed it. Records go through
//! the consensus codec: the spender hash followed by var-int input index
//! and confirming height, so the common low-index, low-height entry stays
//! a few bytes shorter than a fixed-width row.

use std::sync::Arc;

use keeld_consensus::Hash256;
use keeld_primitives::encoding::{DecodeError, Decoder, Encoder};
use keeld_primitives::OutPoint;
use keeld_storage::{Backend, Batch, Table};

use crate::{outpoint_key, ChainError};

/// The input that first spent an output, with its confirming height.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpendEntry {
    pub hash: Hash256,
    pub index: u32,
    pub height: u32,
}

impl SpendEntry {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(42);
        encoder.write_hash(&self.hash);
        encoder.write_var_int(u64::from(self.index));
        encoder.write_var_int(u64::from(self.height));
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let hash = decoder.read_hash()?;
        let index = decoder.read_var_int()?;
        let height = decoder.read_var_int()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash,
            index: u32::try_from(index).map_err(|_| DecodeError::Overflow)?,
            height: u32::try_from(height).map_err(|_| DecodeError::Overflow)?,
        })
    }
}

pub struct SpendTable<S> {
    store: Arc<S>,
}

impl<S> SpendTable<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: Backend> SpendTable<S> {
    /// Record `entry` as the first spender of `outpoint`.
    pub fn mark(&self, batch: &mut Batch, outpoint: &OutPoint, entry: SpendEntry) {
        batch.insert(Table::Spends, &outpoint_key(outpoint), entry.encode());
    }

    /// Forget a spend, restoring the outpoint to unspent.
    pub fn unmark(&self, batch: &mut Batch, outpoint: &OutPoint) {
        batch.remove(Table::Spends, &outpoint_key(outpoint));
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<SpendEntry>, ChainError> {
        match self.store.read(Table::Spends, &outpoint_key(outpoint))? {
            Some(bytes) => Ok(Some(SpendEntry::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeld_storage::memory::MemoryStore;

    #[test]
    fn small_entries_encode_compactly() {
        let entry = SpendEntry {
            hash: [0x22; 32],
            index: 0,
            height: 15,
        };
        let bytes = entry.encode();
        assert_eq!(bytes.len(), 34);
        assert_eq!(SpendEntry::decode(&bytes).expect("decode"), entry);

        let wide = SpendEntry {
            hash: [0x23; 32],
            index: 70_000,
            height: 2_000_000,
        };
        let bytes = wide.encode();
        assert_eq!(bytes.len(), 42);
        assert_eq!(SpendEntry::decode(&bytes).expect("decode"), wide);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let entry = SpendEntry {
            hash: [0x22; 32],
            index: 1,
            height: 2,
        };
        let mut bytes = entry.encode();
        bytes.push(0);
        assert_eq!(
            SpendEntry::decode(&bytes),
            Err(DecodeError::TrailingBytes)
        );
    }

    #[test]
    fn mark_and_unmark_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let table = SpendTable::new(Arc::clone(&store));
        let outpoint = OutPoint {
            hash: [0x21; 32],
            index: 1,
        };
        let entry = SpendEntry {
            hash: [0x22; 32],
            index: 0,
            height: 15,
        };

        let mut batch = Batch::new();
        table.mark(&mut batch, &outpoint, entry);
        store.apply(batch).expect("apply");
        assert_eq!(table.get(&outpoint).expect("get"), Some(entry));

        let mut batch = Batch::new();
        table.unmark(&mut batch, &outpoint);
        store.apply(batch).expect("apply");
        assert_eq!(table.get(&outpoint).expect("get"), None);
    }
}
