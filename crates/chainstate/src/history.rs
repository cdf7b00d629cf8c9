//! Payment history index keyed by script hash.
//!
//! Key layout: sha256(script) ++ be(height) ++ be(sequence), so one prefix
//! scan returns a script's rows in height order.

use std::sync::Arc;

use keeld_consensus::Hash256;
use keeld_primitives::encoding::{DecodeError, Decoder, Encoder};
use keeld_primitives::{sha256, OutPoint};
use keeld_storage::{Backend, Batch, Table};
use smallvec::SmallVec;

use crate::{height_key, ChainError};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HistoryRow {
    /// An output paying to the script.
    Output {
        outpoint: OutPoint,
        height: u32,
        value: i64,
    },
    /// An input spending one of the script's outputs.
    Spend {
        inputpoint: OutPoint,
        height: u32,
        previous: OutPoint,
    },
}

impl HistoryRow {
    pub fn height(&self) -> u32 {
        match self {
            HistoryRow::Output { height, .. } => *height,
            HistoryRow::Spend { height, .. } => *height,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(49);
        match self {
            HistoryRow::Output {
                outpoint,
                height,
                value,
            } => {
                encoder.write_u8(0);
                outpoint.encode_into(&mut encoder);
                encoder.write_u32_le(*height);
                encoder.write_i64_le(*value);
            }
            HistoryRow::Spend {
                inputpoint,
                height,
                previous,
            } => {
                encoder.write_u8(1);
                inputpoint.encode_into(&mut encoder);
                encoder.write_u32_le(*height);
                previous.encode_into(&mut encoder);
            }
        }
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let kind = decoder.read_u8()?;
        let row = match kind {
            0 => {
                let outpoint = OutPoint::decode_from(&mut decoder)?;
                let height = decoder.read_u32_le()?;
                let value = decoder.read_i64_le()?;
                HistoryRow::Output {
                    outpoint,
                    height,
                    value,
                }
            }
            _ => {
                let inputpoint = OutPoint::decode_from(&mut decoder)?;
                let height = decoder.read_u32_le()?;
                let previous = OutPoint::decode_from(&mut decoder)?;
                HistoryRow::Spend {
                    inputpoint,
                    height,
                    previous,
                }
            }
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(row)
    }
}

pub fn script_hash(script_pubkey: &[u8]) -> Hash256 {
    sha256(script_pubkey)
}

fn row_key(script_pubkey: &[u8], height: u32, sequence: u32) -> SmallVec<[u8; 40]> {
    let mut key = SmallVec::new();
    key.extend_from_slice(&script_hash(script_pubkey));
    key.extend_from_slice(&height_key(height));
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

pub struct HistoryTable<S> {
    store: Arc<S>,
}

impl<S> HistoryTable<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: Backend> HistoryTable<S> {
    pub fn put(
        &self,
        batch: &mut Batch,
        script_pubkey: &[u8],
        sequence: u32,
        row: &HistoryRow,
    ) {
        batch.insert(
            Table::History,
            &row_key(script_pubkey, row.height(), sequence),
            row.encode(),
        );
    }

    pub fn delete(&self, batch: &mut Batch, script_pubkey: &[u8], height: u32, sequence: u32) {
        batch.remove(Table::History, &row_key(script_pubkey, height, sequence));
    }

    pub fn scan(&self, script_pubkey: &[u8]) -> Result<Vec<HistoryRow>, ChainError> {
        let prefix = script_hash(script_pubkey);
        let mut rows = Vec::new();
        let mut decode_failure = None;
        self.store
            .scan(Table::History, &prefix, &mut |_, value| {
                match HistoryRow::decode(value) {
                    Ok(row) => {
                        rows.push(row);
                        true
                    }
                    Err(err) => {
                        decode_failure = Some(err);
                        false
                    }
                }
            })?;
        match decode_failure {
            Some(err) => Err(err.into()),
            None => Ok(rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeld_storage::memory::MemoryStore;

    #[test]
    fn scan_returns_rows_in_height_order() {
        let store = Arc::new(MemoryStore::new());
        let table = HistoryTable::new(Arc::clone(&store));
        let script = vec![0x51];

        let late = HistoryRow::Output {
            outpoint: OutPoint {
                hash: [0x01; 32],
                index: 0,
            },
            height: 20,
            value: 5,
        };
        let early = HistoryRow::Spend {
            inputpoint: OutPoint {
                hash: [0x02; 32],
                index: 1,
            },
            height: 3,
            previous: OutPoint {
                hash: [0x03; 32],
                index: 0,
            },
        };

        let mut batch = Batch::new();
        table.put(&mut batch, &script, 0, &late);
        table.put(&mut batch, &script, 0, &early);
        store.apply(batch).expect("apply");

        let rows = table.scan(&script).expect("scan");
        assert_eq!(rows, vec![early, late]);

        // Unrelated scripts see nothing.
        assert!(table.scan(&[0x52]).expect("scan").is_empty());
    }
}
