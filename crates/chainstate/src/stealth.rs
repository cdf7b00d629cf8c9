//! Stealth row index over data-carrier outputs.
//!
//! An output whose script is `OP_RETURN <payload>` with a payload of at
//! least 36 bytes contributes a row: a 4-byte filter prefix, a 32-byte
//! ephemeral key, and the carrying transaction hash. Rows are keyed by
//! height so wallet rescans can resume from a checkpoint.

use std::sync::Arc;

use keeld_consensus::Hash256;
use keeld_storage::{Backend, Batch, Table};

use crate::{height_key, ChainError};

const OP_RETURN: u8 = 0x6a;
const OP_PUSHDATA1: u8 = 0x4c;
const MIN_PAYLOAD: usize = 36;
const ROW_LEN: usize = 68;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StealthRow {
    pub prefix: u32,
    pub ephemeral_key: Hash256,
    pub tx_hash: Hash256,
}

impl StealthRow {
    fn encode(&self) -> [u8; ROW_LEN] {
        let mut out = [0u8; ROW_LEN];
        out[0..4].copy_from_slice(&self.prefix.to_le_bytes());
        out[4..36].copy_from_slice(&self.ephemeral_key);
        out[36..68].copy_from_slice(&self.tx_hash);
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ROW_LEN {
            return None;
        }
        let prefix = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let ephemeral_key: Hash256 = bytes[4..36].try_into().ok()?;
        let tx_hash: Hash256 = bytes[36..68].try_into().ok()?;
        Some(Self {
            prefix,
            ephemeral_key,
            tx_hash,
        })
    }
}

/// Extract a stealth row from a data-carrier script, if it qualifies.
pub fn row_from_script(script_pubkey: &[u8], tx_hash: Hash256) -> Option<StealthRow> {
    let payload = data_carrier_payload(script_pubkey)?;
    if payload.len() < MIN_PAYLOAD {
        return None;
    }
    let prefix = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let ephemeral_key: Hash256 = payload[4..36].try_into().ok()?;
    Some(StealthRow {
        prefix,
        ephemeral_key,
        tx_hash,
    })
}

fn data_carrier_payload(script: &[u8]) -> Option<&[u8]> {
    if script.first() != Some(&OP_RETURN) {
        return None;
    }
    match script.get(1)? {
        len @ 1..=75 => script.get(2..2 + *len as usize),
        &OP_PUSHDATA1 => {
            let len = *script.get(2)? as usize;
            script.get(3..3 + len)
        }
        _ => None,
    }
}

fn row_key(height: u32, sequence: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[0..4].copy_from_slice(&height_key(height));
    key[4..8].copy_from_slice(&sequence.to_be_bytes());
    key
}

pub struct StealthTable<S> {
    store: Arc<S>,
}

impl<S> StealthTable<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: Backend> StealthTable<S> {
    pub fn put(&self, batch: &mut Batch, height: u32, sequence: u32, row: &StealthRow) {
        batch.insert(Table::Stealth, &row_key(height, sequence), row.encode());
    }

    pub fn delete(&self, batch: &mut Batch, height: u32, sequence: u32) {
        batch.remove(Table::Stealth, &row_key(height, sequence));
    }

    /// Rows whose prefix matches `prefix` in its top `prefix_bits` bits, at
    /// or above `from_height`. Height-ordered keys let the walk start at
    /// `from_height` directly.
    pub fn scan(
        &self,
        prefix: u32,
        prefix_bits: u8,
        from_height: u32,
    ) -> Result<Vec<(u32, StealthRow)>, ChainError> {
        let mask = if prefix_bits == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_bits.min(32) as u32)
        };
        let mut rows = Vec::new();
        let mut malformed = false;
        self.store.scan(Table::Stealth, &[], &mut |key, value| {
            let Some(height_bytes) = key.get(0..4) else {
                malformed = true;
                return false;
            };
            let height = u32::from_be_bytes(height_bytes.try_into().expect("length checked"));
            if height < from_height {
                return true;
            }
            let Some(row) = StealthRow::decode(value) else {
                malformed = true;
                return false;
            };
            if row.prefix & mask == prefix & mask {
                rows.push((height, row));
            }
            true
        })?;
        if malformed {
            return Err(ChainError::OperationFailed("malformed stealth entry"));
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeld_storage::memory::MemoryStore;

    fn carrier_script(payload: &[u8]) -> Vec<u8> {
        let mut script = vec![OP_RETURN, payload.len() as u8];
        script.extend_from_slice(payload);
        script
    }

    #[test]
    fn short_payload_is_not_a_row() {
        assert!(row_from_script(&carrier_script(&[0u8; 35]), [0; 32]).is_none());
        assert!(row_from_script(&[0x51], [0; 32]).is_none());
    }

    #[test]
    fn row_extraction_and_prefix_scan() {
        let mut payload = vec![0u8; 36];
        payload[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        payload[4..36].copy_from_slice(&[0x07; 32]);
        let row = row_from_script(&carrier_script(&payload), [0x09; 32]).expect("row");
        assert_eq!(row.prefix, 0xdead_beef);
        assert_eq!(row.ephemeral_key, [0x07; 32]);

        let store = Arc::new(MemoryStore::new());
        let table = StealthTable::new(Arc::clone(&store));
        let mut batch = Batch::new();
        table.put(&mut batch, 40, 0, &row);
        store.apply(batch).expect("apply");

        // Full-prefix match, height filter, and zero-bit wildcard.
        assert_eq!(table.scan(0xdead_beef, 32, 0).expect("scan").len(), 1);
        assert_eq!(table.scan(0xdead_beef, 32, 41).expect("scan").len(), 0);
        assert_eq!(table.scan(0, 0, 0).expect("scan").len(), 1);
        assert_eq!(table.scan(0xffff_ffff, 32, 0).expect("scan").len(), 0);
    }
}
