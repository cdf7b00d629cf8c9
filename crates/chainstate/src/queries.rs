//! Public query surface, safe for use concurrent with the writer.
//!
//! Every fetch runs under the sequence-lock spin protocol: sample, read,
//! re-validate, and retry on interference. Fast-chain getters on
//! [`ChainStore`] skip the protocol and are reserved for the organizer's
//! critical section.

use keeld_consensus::{Hash256, NULL_HASH};
use keeld_primitives::block::{Block, BlockHeader};
use keeld_primitives::{OutPoint, Transaction, TxOut};
use keeld_storage::Backend;

use crate::blocks::BlockRecord;
use crate::history::HistoryRow;
use crate::spends::SpendEntry;
use crate::stealth::StealthRow;
use crate::store::ChainStore;
use crate::transactions::UNCONFIRMED;
use crate::ChainError;

/// Sparse hash sample a peer sends to find the common chain prefix.
#[derive(Clone, Debug, Default)]
pub struct BlockLocator {
    pub start_hashes: Vec<Hash256>,
    pub stop_hash: Hash256,
}

impl<S: Backend> ChainStore<S> {
    fn check_open(&self) -> Result<(), ChainError> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(ChainError::Stopped);
        }
        Ok(())
    }

    fn read_serial<T>(
        &self,
        mut reader: impl FnMut() -> Result<T, ChainError>,
    ) -> Result<T, ChainError> {
        self.check_open()?;
        self.sequence.read_serial(&mut reader)
    }

    fn block_from_record(&self, record: &BlockRecord) -> Result<Block, ChainError> {
        let mut transactions = Vec::with_capacity(record.txids.len());
        for txid in &record.txids {
            let tx_record = self
                .get_transaction_record(txid)?
                .ok_or(ChainError::OperationFailed("stored block missing transaction"))?;
            transactions.push(tx_record.tx);
        }
        Ok(Block::new(record.header, transactions))
    }

    // Block queries.
    //-------------------------------------------------------------------------

    pub fn fetch_block(&self, height: u32) -> Result<(Block, u32), ChainError> {
        self.read_serial(|| {
            let record = self.get_record_at(height)?.ok_or(ChainError::NotFound)?;
            Ok((self.block_from_record(&record)?, record.height))
        })
    }

    pub fn fetch_block_by_hash(&self, hash: &Hash256) -> Result<(Block, u32), ChainError> {
        self.read_serial(|| {
            let record = self.get_block_record(hash)?.ok_or(ChainError::NotFound)?;
            Ok((self.block_from_record(&record)?, record.height))
        })
    }

    pub fn fetch_block_header(&self, height: u32) -> Result<(BlockHeader, u32), ChainError> {
        self.read_serial(|| {
            let record = self.get_record_at(height)?.ok_or(ChainError::NotFound)?;
            Ok((record.header, record.height))
        })
    }

    pub fn fetch_block_header_by_hash(
        &self,
        hash: &Hash256,
    ) -> Result<(BlockHeader, u32), ChainError> {
        self.read_serial(|| {
            let record = self.get_block_record(hash)?.ok_or(ChainError::NotFound)?;
            Ok((record.header, record.height))
        })
    }

    /// Header plus transaction count and hash list.
    pub fn fetch_merkle_block(
        &self,
        height: u32,
    ) -> Result<(BlockHeader, u32, Vec<Hash256>), ChainError> {
        self.read_serial(|| {
            let record = self.get_record_at(height)?.ok_or(ChainError::NotFound)?;
            Ok((record.header, record.txids.len() as u32, record.txids))
        })
    }

    pub fn fetch_merkle_block_by_hash(
        &self,
        hash: &Hash256,
    ) -> Result<(BlockHeader, u32, Vec<Hash256>), ChainError> {
        self.read_serial(|| {
            let record = self.get_block_record(hash)?.ok_or(ChainError::NotFound)?;
            Ok((record.header, record.txids.len() as u32, record.txids))
        })
    }

    pub fn fetch_block_height(&self, hash: &Hash256) -> Result<u32, ChainError> {
        self.read_serial(|| self.get_height(hash)?.ok_or(ChainError::NotFound))
    }

    pub fn fetch_last_height(&self) -> Result<u32, ChainError> {
        self.read_serial(|| self.get_last_height()?.ok_or(ChainError::NotFound))
    }

    // Transaction queries.
    //-------------------------------------------------------------------------

    pub fn fetch_transaction(
        &self,
        hash: &Hash256,
        require_confirmed: bool,
    ) -> Result<(Transaction, u32, u32), ChainError> {
        self.read_serial(|| {
            let record = self
                .get_transaction_record(hash)?
                .ok_or(ChainError::NotFound)?;
            if require_confirmed && !record.is_confirmed() {
                return Err(ChainError::NotFound);
            }
            Ok((record.tx, record.height, record.position))
        })
    }

    pub fn fetch_transaction_position(&self, hash: &Hash256) -> Result<(u32, u32), ChainError> {
        self.read_serial(|| {
            let record = self
                .get_transaction_record(hash)?
                .ok_or(ChainError::NotFound)?;
            Ok((record.height, record.position))
        })
    }

    pub fn fetch_output(
        &self,
        outpoint: &OutPoint,
        require_confirmed: bool,
    ) -> Result<TxOut, ChainError> {
        self.read_serial(|| {
            let fork_height = if require_confirmed {
                UNCONFIRMED - 1
            } else {
                UNCONFIRMED
            };
            let entry = self
                .get_output(outpoint, fork_height)?
                .ok_or(ChainError::NotFound)?;
            Ok(entry.output)
        })
    }

    pub fn fetch_spend(&self, outpoint: &OutPoint) -> Result<SpendEntry, ChainError> {
        self.read_serial(|| self.get_spend(outpoint)?.ok_or(ChainError::NotFound))
    }

    // Index queries.
    //-------------------------------------------------------------------------

    /// Most recent `limit` history rows for a script at or above
    /// `from_height`. Zero means unlimited.
    pub fn fetch_history(
        &self,
        script_pubkey: &[u8],
        limit: usize,
        from_height: u32,
    ) -> Result<Vec<HistoryRow>, ChainError> {
        self.read_serial(|| {
            let mut rows: Vec<HistoryRow> = self
                .history_rows(script_pubkey)?
                .into_iter()
                .filter(|row| row.height() >= from_height)
                .collect();
            rows.reverse();
            if limit > 0 {
                rows.truncate(limit);
            }
            Ok(rows)
        })
    }

    pub fn fetch_stealth(
        &self,
        prefix: u32,
        prefix_bits: u8,
        from_height: u32,
    ) -> Result<Vec<(u32, StealthRow)>, ChainError> {
        self.read_serial(|| self.stealth_rows(prefix, prefix_bits, from_height))
    }

    // Locator queries.
    //-------------------------------------------------------------------------

    pub fn fetch_block_locator(&self, heights: &[u32]) -> Result<Vec<Hash256>, ChainError> {
        self.read_serial(|| {
            let mut hashes = Vec::with_capacity(heights.len());
            for height in heights {
                match self.get_hash(*height)? {
                    Some(hash) => hashes.push(hash),
                    None => return Err(ChainError::NotFound),
                }
            }
            Ok(hashes)
        })
    }

    pub fn fetch_locator_block_hashes(
        &self,
        locator: &BlockLocator,
        threshold: Option<&Hash256>,
        limit: u32,
    ) -> Result<Vec<Hash256>, ChainError> {
        self.read_serial(|| {
            let (begin, stop) = self.locator_range(locator, threshold, limit)?;
            let mut hashes = Vec::new();
            for height in begin..stop {
                match self.get_hash(height)? {
                    Some(hash) => hashes.push(hash),
                    None => break,
                }
            }
            Ok(hashes)
        })
    }

    pub fn fetch_locator_block_headers(
        &self,
        locator: &BlockLocator,
        threshold: Option<&Hash256>,
        limit: u32,
    ) -> Result<Vec<BlockHeader>, ChainError> {
        self.read_serial(|| {
            let (begin, stop) = self.locator_range(locator, threshold, limit)?;
            let mut headers = Vec::new();
            for height in begin..stop {
                match self.get_header(height)? {
                    Some(header) => headers.push(header),
                    None => break,
                }
            }
            Ok(headers)
        })
    }

    /// Shared range resolution for both locator walks.
    ///
    /// The first locator hash on the main chain fixes `start` (else zero);
    /// `stop` is `start + limit + 1`, clamped by an on-chain stop hash; an
    /// on-chain threshold above `start` raises it.
    fn locator_range(
        &self,
        locator: &BlockLocator,
        threshold: Option<&Hash256>,
        limit: u32,
    ) -> Result<(u32, u32), ChainError> {
        let mut start = 0u32;
        for hash in &locator.start_hashes {
            if let Some(height) = self.get_height(hash)? {
                start = height;
                break;
            }
        }

        let mut stop = start.saturating_add(limit).saturating_add(1);
        if locator.stop_hash != NULL_HASH {
            if let Some(height) = self.get_height(&locator.stop_hash)? {
                stop = stop.min(height);
            }
        }

        if let Some(threshold) = threshold {
            if let Some(height) = self.get_height(threshold)? {
                start = start.max(height);
            }
        }

        Ok((start + 1, stop))
    }

    // Inventory filters.
    //-------------------------------------------------------------------------

    /// Remove hashes already present as blocks on the main chain.
    pub fn filter_blocks(&self, hashes: &mut Vec<Hash256>) -> Result<(), ChainError> {
        self.read_serial(|| {
            let mut kept = Vec::with_capacity(hashes.len());
            for hash in hashes.iter() {
                if !self.block_exists(hash)? {
                    kept.push(*hash);
                }
            }
            Ok(kept)
        })
        .map(|kept| *hashes = kept)
    }

    /// Remove hashes of stored transactions that still have unspent outputs.
    pub fn filter_transactions(&self, hashes: &mut Vec<Hash256>) -> Result<(), ChainError> {
        self.read_serial(|| {
            let mut kept = Vec::with_capacity(hashes.len());
            for hash in hashes.iter() {
                if !self.get_is_unspent_transaction(hash, UNCONFIRMED)? {
                    kept.push(*hash);
                }
            }
            Ok(kept)
        })
        .map(|kept| *hashes = kept)
    }
}
