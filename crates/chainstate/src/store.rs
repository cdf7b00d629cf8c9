//! The fast-chain store.
//!
//! Single-writer, many-reader. Writers bracket every mutation with the
//! sequence lock; queries in [`crate::queries`] run the reader spin
//! protocol. Mutations commit one write batch per block.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keeld_consensus::Hash256;
use keeld_pow::difficulty::{block_proof, HeaderInfo};
use keeld_primitives::block::{Block, BlockHeader};
use keeld_primitives::{OutPoint, Transaction};
use keeld_storage::{Backend, Batch, Table};
use primitive_types::U256;
use tracing::error;

use crate::blocks::{BlockRecord, BlockTable};
use crate::history::{HistoryRow, HistoryTable};
use crate::sequence::SequenceLock;
use crate::spends::{SpendEntry, SpendTable};
use crate::stealth::{self, StealthTable};
use crate::transactions::{OutputEntry, TxRecord, TxTable, NOT_SPENT};
use crate::ChainError;

const META_TIP: &[u8] = b"tip";

/// The on-chain parent a branch attaches to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ForkPoint {
    pub hash: Hash256,
    pub height: u32,
}

pub struct ChainStore<S> {
    store: Arc<S>,
    blocks: BlockTable<S>,
    txs: TxTable<S>,
    spends: SpendTable<S>,
    history: HistoryTable<S>,
    stealth: StealthTable<S>,
    pub(crate) sequence: SequenceLock,
    bulk_insert: AtomicBool,
    corrupted: AtomicBool,
    pub(crate) closed: AtomicBool,
}

impl<S: Backend> ChainStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            blocks: BlockTable::new(Arc::clone(&store)),
            txs: TxTable::new(Arc::clone(&store)),
            spends: SpendTable::new(Arc::clone(&store)),
            history: HistoryTable::new(Arc::clone(&store)),
            stealth: StealthTable::new(Arc::clone(&store)),
            store,
            sequence: SequenceLock::new(),
            bulk_insert: AtomicBool::new(false),
            corrupted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    // Sequential locking surface.
    //-------------------------------------------------------------------------

    pub fn begin_read(&self) -> u64 {
        self.sequence.begin_read()
    }

    pub fn is_write_locked(sequence: u64) -> bool {
        SequenceLock::is_write_locked(sequence)
    }

    pub fn is_read_valid(&self, sequence: u64) -> bool {
        self.sequence.is_read_valid(sequence)
    }

    pub fn begin_write(&self) {
        self.sequence.begin_write();
    }

    pub fn end_write(&self) {
        self.sequence.end_write();
    }

    /// Suppress per-write flushing for a closely spaced series of inserts.
    pub fn flush_lock(&self) {
        self.bulk_insert.store(true, Ordering::Release);
    }

    pub fn flush_unlock(&self) -> Result<(), ChainError> {
        self.bulk_insert.store(false, Ordering::Release);
        self.store.persist()?;
        Ok(())
    }

    /// Bracket for batched initial-download inserts.
    pub fn begin_insert(&self) {
        self.flush_lock();
    }

    pub fn end_insert(&self) -> Result<(), ChainError> {
        self.flush_unlock()
    }

    // Lifecycle.
    //-------------------------------------------------------------------------

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    pub fn close(&self) -> Result<(), ChainError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.persist()?;
        Ok(())
    }

    fn check_writable(&self) -> Result<(), ChainError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChainError::Stopped);
        }
        if self.is_corrupted() {
            return Err(ChainError::Corrupted);
        }
        Ok(())
    }

    // Fast-chain readers. These run under the organizer's writer mutex and
    // read the store directly, without the spin protocol.
    //-------------------------------------------------------------------------

    pub fn get_last_height(&self) -> Result<Option<u32>, ChainError> {
        match self.store.read(Table::Meta, META_TIP)? {
            Some(bytes) => {
                let height = u32::from_le_bytes(
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| ChainError::OperationFailed("malformed tip record"))?,
                );
                Ok(Some(height))
            }
            None => Ok(None),
        }
    }

    pub fn block_exists(&self, hash: &Hash256) -> Result<bool, ChainError> {
        self.blocks.exists(hash)
    }

    pub fn get_height(&self, hash: &Hash256) -> Result<Option<u32>, ChainError> {
        Ok(self.blocks.get(hash)?.map(|record| record.height))
    }

    pub fn get_block_record(&self, hash: &Hash256) -> Result<Option<BlockRecord>, ChainError> {
        self.blocks.get(hash)
    }

    pub fn get_record_at(&self, height: u32) -> Result<Option<BlockRecord>, ChainError> {
        self.blocks.get_at(height)
    }

    pub fn get_hash(&self, height: u32) -> Result<Option<Hash256>, ChainError> {
        self.blocks.get_hash(height)
    }

    pub fn get_header(&self, height: u32) -> Result<Option<BlockHeader>, ChainError> {
        Ok(self.blocks.get_at(height)?.map(|record| record.header))
    }

    pub fn get_bits(&self, height: u32) -> Result<Option<u32>, ChainError> {
        Ok(self.get_header(height)?.map(|header| header.bits))
    }

    pub fn get_timestamp(&self, height: u32) -> Result<Option<u32>, ChainError> {
        Ok(self.get_header(height)?.map(|header| header.time))
    }

    pub fn get_version(&self, height: u32) -> Result<Option<i32>, ChainError> {
        Ok(self.get_header(height)?.map(|header| header.version))
    }

    pub fn get_header_info(&self, height: u32) -> Result<Option<HeaderInfo>, ChainError> {
        Ok(self.get_header(height)?.map(|header| HeaderInfo {
            height: i64::from(height),
            time: i64::from(header.time),
            bits: header.bits,
            version: header.version,
        }))
    }

    /// Missing heights in `[0, tip]`, present only after out-of-order inserts.
    pub fn get_gaps(&self) -> Result<Vec<u32>, ChainError> {
        let Some(tip) = self.get_last_height()? else {
            return Ok(Vec::new());
        };
        let mut present = HashSet::new();
        self.store.scan(Table::Heights, &[], &mut |key, _| {
            if let Ok(bytes) = key.try_into() {
                present.insert(u32::from_be_bytes(bytes));
            }
            true
        })?;
        Ok((0..=tip).filter(|height| !present.contains(height)).collect())
    }

    /// Cumulative proof over stored blocks in `[from_height, tip]`.
    ///
    /// Stops accumulating once the sum exceeds `maximum`; a missing ancestor
    /// is an operation failure.
    pub fn get_branch_work(&self, maximum: &U256, from_height: u32) -> Result<U256, ChainError> {
        let Some(tip) = self.get_last_height()? else {
            return Ok(U256::zero());
        };
        let mut total = U256::zero();
        for height in from_height..=tip {
            if total > *maximum {
                break;
            }
            let bits = self
                .get_bits(height)?
                .ok_or(ChainError::OperationFailed("missing ancestor header"))?;
            let proof = block_proof(bits)
                .map_err(|_| ChainError::OperationFailed("stored header has invalid bits"))?;
            total = total.saturating_add(proof);
        }
        Ok(total)
    }

    pub fn get_transaction_record(&self, hash: &Hash256) -> Result<Option<TxRecord>, ChainError> {
        self.txs.get(hash)
    }

    /// Resolve an output as visible from a chain truncated at `fork_height`.
    pub fn get_output(
        &self,
        outpoint: &OutPoint,
        fork_height: u32,
    ) -> Result<Option<OutputEntry>, ChainError> {
        let Some(record) = self.txs.get(&outpoint.hash)? else {
            return Ok(None);
        };
        if record.height > fork_height {
            return Ok(None);
        }
        let index = outpoint.index as usize;
        let Some(output) = record.tx.vout.get(index) else {
            return Ok(None);
        };
        Ok(Some(OutputEntry {
            output: output.clone(),
            height: record.height,
            position: record.position,
            spender_height: record
                .spender_heights
                .get(index)
                .copied()
                .unwrap_or(NOT_SPENT),
        }))
    }

    pub fn get_is_unspent_transaction(
        &self,
        hash: &Hash256,
        fork_height: u32,
    ) -> Result<bool, ChainError> {
        let Some(record) = self.txs.get(hash)? else {
            return Ok(false);
        };
        if record.height > fork_height {
            return Ok(false);
        }
        let unspent = (0..record.tx.vout.len() as u32)
            .any(|index| !record.is_spent_at(index, fork_height));
        Ok(unspent)
    }

    pub fn get_spend(&self, outpoint: &OutPoint) -> Result<Option<SpendEntry>, ChainError> {
        self.spends.get(outpoint)
    }

    pub(crate) fn history_rows(&self, script_pubkey: &[u8]) -> Result<Vec<HistoryRow>, ChainError> {
        self.history.scan(script_pubkey)
    }

    pub(crate) fn stealth_rows(
        &self,
        prefix: u32,
        prefix_bits: u8,
        from_height: u32,
    ) -> Result<Vec<(u32, crate::stealth::StealthRow)>, ChainError> {
        self.stealth.scan(prefix, prefix_bits, from_height)
    }

    // Writers.
    //-------------------------------------------------------------------------

    /// Append a fully validated block that extends the tip. Used by initial
    /// block download; `height` must be `tip + 1` (or zero for genesis).
    pub fn insert(&self, block: &Block, height: u32) -> Result<(), ChainError> {
        self.check_writable()?;
        self.sequence.begin_write();
        let result = self.do_insert(block, height);
        self.sequence.end_write();
        result
    }

    fn do_insert(&self, block: &Block, height: u32) -> Result<(), ChainError> {
        let tip = self.get_last_height()?;
        let expected = tip.map_or(0, |tip| tip + 1);
        if height != expected {
            return Err(ChainError::OperationFailed("insert height does not extend tip"));
        }
        if self.blocks.get_hash(height)?.is_some() {
            return Err(ChainError::OperationFailed("insert height already occupied"));
        }
        self.push_block(block, height)
    }

    /// Admit an unconfirmed transaction record.
    pub fn push_transaction(&self, tx: &Transaction) -> Result<Hash256, ChainError> {
        self.check_writable()?;
        self.sequence.begin_write();
        let result = self.do_push_transaction(tx);
        self.sequence.end_write();
        result
    }

    fn do_push_transaction(&self, tx: &Transaction) -> Result<Hash256, ChainError> {
        let txid = tx.txid();
        if self.txs.exists(&txid)? {
            return Err(ChainError::OperationFailed("transaction already stored"));
        }
        let mut batch = Batch::new();
        self.txs
            .put(&mut batch, &txid, &TxRecord::unconfirmed(tx.clone()));
        self.store.apply(batch)?;
        Ok(txid)
    }

    /// Atomically replace all blocks above `fork` with `incoming`.
    ///
    /// Returns the displaced blocks in reverse order (old top first). On a
    /// mid-push failure the store is rolled back to the pre-call tip; if the
    /// rollback itself fails the store is marked corrupted and every later
    /// write fails fast.
    pub fn reorganize(
        &self,
        fork: &ForkPoint,
        incoming: &[Arc<Block>],
    ) -> Result<Vec<Arc<Block>>, ChainError> {
        self.check_writable()?;
        self.sequence.begin_write();
        let result = self.do_reorganize(fork, incoming);
        self.sequence.end_write();
        result
    }

    fn do_reorganize(
        &self,
        fork: &ForkPoint,
        incoming: &[Arc<Block>],
    ) -> Result<Vec<Arc<Block>>, ChainError> {
        let tip = self
            .get_last_height()?
            .ok_or(ChainError::OperationFailed("reorganize on empty chain"))?;
        if fork.height > tip {
            return Err(ChainError::OperationFailed("fork point above tip"));
        }
        match self.blocks.get_hash(fork.height)? {
            Some(hash) if hash == fork.hash => {}
            _ => return Err(ChainError::OperationFailed("fork point not on chain")),
        }

        // Pop everything above the fork point, newest first.
        let mut outgoing: Vec<Arc<Block>> = Vec::with_capacity((tip - fork.height) as usize);
        for height in ((fork.height + 1)..=tip).rev() {
            match self.pop_block(height) {
                Ok(block) => outgoing.push(Arc::new(block)),
                Err(err) => {
                    self.restore_outgoing(fork.height, &outgoing)?;
                    return Err(err);
                }
            }
        }

        let mut pushed = 0u32;
        for (offset, block) in incoming.iter().enumerate() {
            let height = fork.height + 1 + offset as u32;
            if let Err(err) = self.push_block(block, height) {
                self.unwind_incoming(fork.height, pushed, &outgoing)?;
                return Err(err);
            }
            pushed += 1;
        }

        if !self.bulk_insert.load(Ordering::Acquire) {
            self.store.persist()?;
        }
        Ok(outgoing)
    }

    /// Re-push popped blocks after a failed pop sequence.
    fn restore_outgoing(
        &self,
        fork_height: u32,
        outgoing: &[Arc<Block>],
    ) -> Result<(), ChainError> {
        for (offset, block) in outgoing.iter().rev().enumerate() {
            let height = fork_height + 1 + offset as u32;
            if self.push_block(block, height).is_err() {
                self.mark_corrupted("rollback after failed pop");
                return Err(ChainError::Corrupted);
            }
        }
        Ok(())
    }

    /// Pop partially pushed incoming blocks, then restore the original chain.
    fn unwind_incoming(
        &self,
        fork_height: u32,
        pushed: u32,
        outgoing: &[Arc<Block>],
    ) -> Result<(), ChainError> {
        for height in ((fork_height + 1)..=(fork_height + pushed)).rev() {
            if self.pop_block(height).is_err() {
                self.mark_corrupted("unwind after failed push");
                return Err(ChainError::Corrupted);
            }
        }
        self.restore_outgoing(fork_height, outgoing)
    }

    fn mark_corrupted(&self, stage: &'static str) {
        self.corrupted.store(true, Ordering::Release);
        error!(stage, "fatal: chain store failed to roll back and is corrupted");
    }

    // Block push/pop. One write batch each; the batch commit is the atom the
    // underlying store must provide.
    //-------------------------------------------------------------------------

    fn push_block(&self, block: &Block, height: u32) -> Result<(), ChainError> {
        if height > 0 {
            let parent = self
                .blocks
                .get_hash(height - 1)?
                .ok_or(ChainError::OperationFailed("push height has no parent"))?;
            if block.header.prev_block != parent {
                return Err(ChainError::OperationFailed("push does not link to parent"));
            }
        }

        let txids = block.txids();
        let mut batch = Batch::new();
        self.blocks.put(
            &mut batch,
            &BlockRecord {
                header: block.header,
                height,
                txids: txids.clone(),
            },
        );

        // Records created or respent by this block, committed together.
        let mut touched: HashMap<Hash256, TxRecord> = HashMap::new();
        for (position, tx) in block.transactions.iter().enumerate() {
            touched.insert(
                txids[position],
                TxRecord {
                    height,
                    position: position as u32,
                    spender_heights: vec![NOT_SPENT; tx.vout.len()],
                    tx: tx.clone(),
                },
            );
        }

        for (position, tx) in block.transactions.iter().enumerate() {
            if tx.is_coinbase() {
                continue;
            }
            for (input_index, input) in tx.vin.iter().enumerate() {
                let prevout = input.prevout;
                if !touched.contains_key(&prevout.hash) {
                    let loaded = self
                        .txs
                        .get(&prevout.hash)?
                        .ok_or(ChainError::OperationFailed("push spends unknown output"))?;
                    touched.insert(prevout.hash, loaded);
                }
                let record = touched.get_mut(&prevout.hash).expect("loaded above");
                let slot = record
                    .spender_heights
                    .get_mut(prevout.index as usize)
                    .ok_or(ChainError::OperationFailed("push spends missing output index"))?;
                *slot = height;
                self.spends.mark(
                    &mut batch,
                    &prevout,
                    SpendEntry {
                        hash: txids[position],
                        index: input_index as u32,
                        height,
                    },
                );
            }
        }

        // History and stealth rows in canonical order: per transaction,
        // outputs then inputs. Pop replays the same order to delete.
        let mut sequence = 0u32;
        for (position, tx) in block.transactions.iter().enumerate() {
            let txid = txids[position];
            for (output_index, output) in tx.vout.iter().enumerate() {
                let outpoint = OutPoint {
                    hash: txid,
                    index: output_index as u32,
                };
                self.history.put(
                    &mut batch,
                    &output.script_pubkey,
                    sequence,
                    &HistoryRow::Output {
                        outpoint,
                        height,
                        value: output.value,
                    },
                );
                if let Some(row) = stealth::row_from_script(&output.script_pubkey, txid) {
                    self.stealth.put(&mut batch, height, sequence, &row);
                }
                sequence += 1;
            }
            if tx.is_coinbase() {
                continue;
            }
            for (input_index, input) in tx.vin.iter().enumerate() {
                let prevout = input.prevout;
                let script = touched
                    .get(&prevout.hash)
                    .and_then(|record| record.tx.vout.get(prevout.index as usize))
                    .map(|output| output.script_pubkey.clone())
                    .ok_or(ChainError::OperationFailed("push spends missing output index"))?;
                self.history.put(
                    &mut batch,
                    &script,
                    sequence,
                    &HistoryRow::Spend {
                        inputpoint: OutPoint {
                            hash: txid,
                            index: input_index as u32,
                        },
                        height,
                        previous: prevout,
                    },
                );
                sequence += 1;
            }
        }

        for (txid, record) in &touched {
            self.txs.put(&mut batch, txid, record);
        }
        batch.insert(Table::Meta, META_TIP, height.to_le_bytes().to_vec());

        self.store.apply(batch)?;
        Ok(())
    }

    fn pop_block(&self, height: u32) -> Result<Block, ChainError> {
        let record = self
            .blocks
            .get_at(height)?
            .ok_or(ChainError::OperationFailed("pop height not stored"))?;

        let mut transactions = Vec::with_capacity(record.txids.len());
        let block_txids: HashSet<Hash256> = record.txids.iter().copied().collect();
        for txid in &record.txids {
            let tx_record = self
                .txs
                .get(txid)?
                .ok_or(ChainError::OperationFailed("pop block missing transaction"))?;
            transactions.push(tx_record);
        }

        let mut batch = Batch::new();
        self.blocks.delete(&mut batch, &record.hash(), height);

        // Restore spender sentinels on prevouts outside this block.
        let mut touched: HashMap<Hash256, TxRecord> = HashMap::new();
        for tx_record in &transactions {
            if tx_record.tx.is_coinbase() {
                continue;
            }
            for input in &tx_record.tx.vin {
                let prevout = input.prevout;
                self.spends.unmark(&mut batch, &prevout);
                if block_txids.contains(&prevout.hash) {
                    continue;
                }
                if !touched.contains_key(&prevout.hash) {
                    let loaded = self
                        .txs
                        .get(&prevout.hash)?
                        .ok_or(ChainError::OperationFailed("pop misses spent prevout"))?;
                    touched.insert(prevout.hash, loaded);
                }
                let record = touched.get_mut(&prevout.hash).expect("loaded above");
                if let Some(slot) = record.spender_heights.get_mut(prevout.index as usize) {
                    *slot = NOT_SPENT;
                }
            }
        }

        // Delete history/stealth rows by replaying the push order.
        let mut sequence = 0u32;
        for (position, tx_record) in transactions.iter().enumerate() {
            let tx = &tx_record.tx;
            for output in &tx.vout {
                self.history
                    .delete(&mut batch, &output.script_pubkey, height, sequence);
                if stealth::row_from_script(&output.script_pubkey, record.txids[position]).is_some()
                {
                    self.stealth.delete(&mut batch, height, sequence);
                }
                sequence += 1;
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                let prevout = input.prevout;
                let script = if block_txids.contains(&prevout.hash) {
                    let index = record
                        .txids
                        .iter()
                        .position(|txid| *txid == prevout.hash)
                        .expect("membership checked");
                    transactions[index]
                        .tx
                        .vout
                        .get(prevout.index as usize)
                        .map(|output| output.script_pubkey.clone())
                } else {
                    touched
                        .get(&prevout.hash)
                        .and_then(|prev| prev.tx.vout.get(prevout.index as usize))
                        .map(|output| output.script_pubkey.clone())
                };
                let script =
                    script.ok_or(ChainError::OperationFailed("pop misses spent prevout"))?;
                self.history.delete(&mut batch, &script, height, sequence);
                sequence += 1;
            }
        }

        for txid in &record.txids {
            self.txs.delete(&mut batch, txid);
        }
        for (txid, tx_record) in &touched {
            self.txs.put(&mut batch, txid, tx_record);
        }
        batch.insert(Table::Meta, META_TIP, (height - 1).to_le_bytes().to_vec());

        self.store.apply(batch)?;
        Ok(Block::new(
            record.header,
            transactions.into_iter().map(|record| record.tx).collect(),
        ))
    }
}
