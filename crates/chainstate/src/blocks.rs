//! Block index backed by the storage contract.
//!
//! `Table::Blocks` maps hash to record; `Table::Heights` maps big-endian
//! height to hash so height scans are ordered.

use std::sync::Arc;

use keeld_consensus::Hash256;
use keeld_primitives::block::{BlockHeader, HEADER_SIZE};
use keeld_primitives::encoding::{DecodeError, Decoder, Encoder};
use keeld_storage::{Backend, Batch, Table};

use crate::{height_key, ChainError};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockRecord {
    pub header: BlockHeader,
    pub height: u32,
    pub txids: Vec<Hash256>,
}

impl BlockRecord {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE + 8 + self.txids.len() * 32);
        encoder.write_bytes(&self.header.encode());
        encoder.write_u32_le(self.height);
        encoder.write_var_int(self.txids.len() as u64);
        for txid in &self.txids {
            encoder.write_hash(txid);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::UnexpectedEof);
        }
        let header = BlockHeader::decode(&bytes[..HEADER_SIZE])?;
        let mut decoder = Decoder::new(&bytes[HEADER_SIZE..]);
        let height = decoder.read_u32_le()?;
        let count = decoder.read_var_int()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::Overflow)?;
        let mut txids = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            txids.push(decoder.read_hash()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            height,
            txids,
        })
    }
}

pub struct BlockTable<S> {
    store: Arc<S>,
}

impl<S> BlockTable<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: Backend> BlockTable<S> {
    pub fn put(&self, batch: &mut Batch, record: &BlockRecord) {
        let hash = record.hash();
        batch.insert(Table::Blocks, &hash, record.encode());
        batch.insert(Table::Heights, &height_key(record.height), hash);
    }

    pub fn delete(&self, batch: &mut Batch, hash: &Hash256, height: u32) {
        batch.remove(Table::Blocks, hash);
        batch.remove(Table::Heights, &height_key(height));
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<BlockRecord>, ChainError> {
        match self.store.read(Table::Blocks, hash)? {
            Some(bytes) => Ok(Some(BlockRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_hash(&self, height: u32) -> Result<Option<Hash256>, ChainError> {
        match self.store.read(Table::Heights, &height_key(height))? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::OperationFailed("malformed height entry"))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn get_at(&self, height: u32) -> Result<Option<BlockRecord>, ChainError> {
        match self.get_hash(height)? {
            Some(hash) => self.get(&hash),
            None => Ok(None),
        }
    }

    pub fn exists(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.store.read(Table::Blocks, hash)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeld_primitives::block::CURRENT_VERSION;

    fn sample_record() -> BlockRecord {
        BlockRecord {
            header: BlockHeader {
                version: CURRENT_VERSION,
                prev_block: [0x01; 32],
                merkle_root: [0x02; 32],
                time: 1_700_000_000,
                bits: 0x207f_ffff,
                nonce: 7,
            },
            height: 12,
            txids: vec![[0x03; 32], [0x04; 32]],
        }
    }

    #[test]
    fn record_roundtrip() {
        let record = sample_record();
        let decoded = BlockRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn table_indexes_by_hash_and_height() {
        use keeld_storage::memory::MemoryStore;

        let store = Arc::new(MemoryStore::new());
        let table = BlockTable::new(Arc::clone(&store));
        let record = sample_record();

        let mut batch = Batch::new();
        table.put(&mut batch, &record);
        store.apply(batch).expect("apply");

        assert!(table.exists(&record.hash()).expect("exists"));
        assert_eq!(table.get_hash(12).expect("hash"), Some(record.hash()));
        assert_eq!(table.get_at(12).expect("record"), Some(record.clone()));

        let mut batch = Batch::new();
        table.delete(&mut batch, &record.hash(), record.height);
        store.apply(batch).expect("apply");
        assert!(!table.exists(&record.hash()).expect("exists"));
    }
}
