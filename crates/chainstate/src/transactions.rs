//! Transaction index with cached per-output spender heights.

use std::sync::Arc;

use keeld_consensus::Hash256;
use keeld_primitives::encoding::{DecodeError, Decoder, Encoder};
use keeld_primitives::{Transaction, TxOut};
use keeld_storage::{Backend, Batch, Table};

use crate::ChainError;

/// Spender-height sentinel for an unspent output.
pub const NOT_SPENT: u32 = u32::MAX;
/// Height sentinel for a transaction admitted but not yet confirmed.
pub const UNCONFIRMED: u32 = u32::MAX;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxRecord {
    pub height: u32,
    pub position: u32,
    pub spender_heights: Vec<u32>,
    pub tx: Transaction,
}

impl TxRecord {
    pub fn unconfirmed(tx: Transaction) -> Self {
        let spender_heights = vec![NOT_SPENT; tx.vout.len()];
        Self {
            height: UNCONFIRMED,
            position: 0,
            spender_heights,
            tx,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.height != UNCONFIRMED
    }

    /// Whether `output_index` is spent by a block at or below `fork_height`.
    pub fn is_spent_at(&self, output_index: u32, fork_height: u32) -> bool {
        match self.spender_heights.get(output_index as usize) {
            Some(spender) => *spender != NOT_SPENT && *spender <= fork_height,
            None => false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(16 + self.tx.serialized_size());
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.position);
        encoder.write_var_int(self.spender_heights.len() as u64);
        for spender in &self.spender_heights {
            encoder.write_u32_le(*spender);
        }
        self.tx.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = decoder.read_u32_le()?;
        let position = decoder.read_u32_le()?;
        let count = decoder.read_var_int()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::Overflow)?;
        let mut spender_heights = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            spender_heights.push(decoder.read_u32_le()?);
        }
        let tx = Transaction::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            height,
            position,
            spender_heights,
            tx,
        })
    }
}

/// One output resolved through the index, with its spend status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputEntry {
    pub output: TxOut,
    pub height: u32,
    pub position: u32,
    pub spender_height: u32,
}

pub struct TxTable<S> {
    store: Arc<S>,
}

impl<S> TxTable<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: Backend> TxTable<S> {
    pub fn put(&self, batch: &mut Batch, txid: &Hash256, record: &TxRecord) {
        batch.insert(Table::Transactions, txid, record.encode());
    }

    pub fn delete(&self, batch: &mut Batch, txid: &Hash256) {
        batch.remove(Table::Transactions, txid);
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<TxRecord>, ChainError> {
        match self.store.read(Table::Transactions, txid)? {
            Some(bytes) => Ok(Some(TxRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, txid: &Hash256) -> Result<bool, ChainError> {
        Ok(self.store.read(Table::Transactions, txid)?.is_some())
    }
}
