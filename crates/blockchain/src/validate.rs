//! Three-stage validation pipeline over a branch.
//!
//! `check` is stateless, `accept` is contextual and resolves prevouts
//! branch-first, `connect` runs the script checks fanned out across the
//! priority pool. Each stage drains to `ServiceStopped` once the organizer
//! stop flag is raised.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use keeld_chainstate::{ChainStore, NOT_SPENT};
use keeld_consensus::constants::{
    COINBASE_MATURITY, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_COINBASE_SIZE, MAX_TIME_OFFSET,
    MIN_COINBASE_SIZE,
};
use keeld_consensus::money::money_range;
use keeld_consensus::{block_subsidy, ChainContext, ChainParams, ForkFlags, Hash256};
use keeld_pow::validation::check_proof_of_work;
use keeld_primitives::{compute_merkle_root, Block, OutPoint};
use keeld_script::ScriptVerifier;
use keeld_storage::Backend;

use crate::branch::Branch;
use crate::dispatch::Dispatcher;
use crate::error::{script_reason, Error};
use crate::populate::Populator;

/// One resolved previous output, as seen from the branch being validated.
#[derive(Clone, Debug)]
pub struct Prevout {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub coinbase: bool,
}

/// Per non-coinbase transaction, per input.
pub type BlockPrevouts = Vec<Vec<Prevout>>;
/// Per branch block.
pub type BranchPrevouts = Vec<BlockPrevouts>;

pub struct BlockValidator<S> {
    chain: Arc<ChainStore<S>>,
    params: ChainParams,
    verifier: Arc<dyn ScriptVerifier>,
    dispatch: Arc<Dispatcher>,
    stopped: Arc<AtomicBool>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// Minimal script-number push of `height`, required at the head of the
/// coinbase input script once height commitment activates.
pub fn height_commitment(height: u32) -> Vec<u8> {
    let mut number = Vec::new();
    let mut value = height;
    while value > 0 {
        number.push((value & 0xff) as u8);
        value >>= 8;
    }
    if let Some(last) = number.last() {
        if last & 0x80 != 0 {
            number.push(0);
        }
    }
    let mut script = Vec::with_capacity(1 + number.len());
    script.push(number.len() as u8);
    script.extend_from_slice(&number);
    script
}

impl<S: Backend> BlockValidator<S> {
    pub fn new(
        chain: Arc<ChainStore<S>>,
        params: ChainParams,
        verifier: Arc<dyn ScriptVerifier>,
        dispatch: Arc<Dispatcher>,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain,
            params,
            verifier,
            dispatch,
            stopped,
        }
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    // Stage one: checks independent of chain state.
    //-------------------------------------------------------------------------

    pub fn check(&self, block: &Block) -> Result<(), Error> {
        if self.stopped() {
            return Err(Error::ServiceStopped);
        }
        if block.transactions.is_empty() {
            return Err(Error::InvalidBlock("block has no transactions"));
        }
        if block.serialized_size() > MAX_BLOCK_SIZE as usize {
            return Err(Error::InvalidBlock("block exceeds size limit"));
        }
        if !block.transactions[0].is_coinbase() {
            return Err(Error::InvalidBlock("first transaction is not a coinbase"));
        }
        if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
            return Err(Error::InvalidBlock("extra coinbase transaction"));
        }

        let coinbase_script = &block.transactions[0].vin[0].script_sig;
        if coinbase_script.len() < MIN_COINBASE_SIZE || coinbase_script.len() > MAX_COINBASE_SIZE {
            return Err(Error::InvalidTransaction("coinbase script size out of range"));
        }

        let txids = block.txids();
        if block.header.merkle_root != compute_merkle_root(&txids) {
            return Err(Error::InvalidBlock("merkle root mismatch"));
        }
        let distinct: HashSet<&Hash256> = txids.iter().collect();
        if distinct.len() != txids.len() {
            return Err(Error::InvalidBlock("duplicate transaction"));
        }

        check_proof_of_work(
            &block.hash(),
            block.header.bits,
            &self.params.consensus.pow_limit,
        )?;

        let sigops: u32 = block
            .transactions
            .iter()
            .map(|tx| tx.signature_operations())
            .sum();
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(Error::InvalidBlock("too many signature operations"));
        }

        for tx in &block.transactions[1..] {
            if tx.vin.is_empty() || tx.vout.is_empty() {
                return Err(Error::InvalidTransaction("transaction has no inputs or outputs"));
            }
            if tx.vin.iter().any(|input| input.prevout.is_null()) {
                return Err(Error::InvalidTransaction("null previous output"));
            }
        }
        let mut total_out = 0i64;
        for tx in &block.transactions {
            for output in &tx.vout {
                if !money_range(output.value) {
                    return Err(Error::InvalidTransaction("output value out of range"));
                }
                total_out = total_out
                    .checked_add(output.value)
                    .filter(|total| money_range(*total))
                    .ok_or(Error::InvalidTransaction("output value out of range"))?;
            }
        }

        Ok(())
    }

    // Stage two: contextual checks and prevout population.
    //-------------------------------------------------------------------------

    pub fn accept(
        &self,
        branch: &Branch,
        populator: &Populator<S>,
    ) -> Result<BranchPrevouts, Error> {
        let fork_height = branch.height().ok_or(Error::OperationFailed)?;
        let now = now_secs();

        // Transactions confirmed earlier in the branch, spendable downstream.
        let mut branch_txs: HashMap<Hash256, (usize, usize)> = HashMap::new();
        let mut branch_spent: HashSet<OutPoint> = HashSet::new();
        let mut prevouts: BranchPrevouts = Vec::with_capacity(branch.len());

        for (block_index, block) in branch.blocks().iter().enumerate() {
            if self.stopped() {
                return Err(Error::ServiceStopped);
            }
            let height = fork_height + 1 + block_index as u32;
            let context = populator.populate(branch, block_index)?;

            self.accept_header(block, &context, now)?;
            let block_prevouts = self.accept_body(
                branch,
                block_index,
                height,
                fork_height,
                &mut branch_txs,
                &mut branch_spent,
            )?;

            if let Ok(mut validation) = block.validation.lock() {
                validation.height = Some(height);
                validation.context = Some(context);
            }
            prevouts.push(block_prevouts);
        }

        Ok(prevouts)
    }

    fn accept_header(
        &self,
        block: &Block,
        context: &ChainContext,
        now: i64,
    ) -> Result<(), Error> {
        let header = &block.header;
        if header.version < context.minimum_version {
            return Err(Error::InvalidHeader("version below enforced minimum"));
        }
        if header.bits != context.next_bits {
            return Err(Error::InvalidHeader("incorrect difficulty target"));
        }
        if i64::from(header.time) <= i64::from(context.median_time_past) {
            return Err(Error::InvalidHeader("timestamp not above median time past"));
        }
        if i64::from(header.time) > now + MAX_TIME_OFFSET {
            return Err(Error::InvalidHeader("timestamp too far in the future"));
        }
        if context.flags.contains(ForkFlags::BIP34) {
            let commitment = height_commitment(context.height);
            if !block.transactions[0].vin[0].script_sig.starts_with(&commitment) {
                return Err(Error::InvalidBlock("coinbase does not commit branch height"));
            }
        }
        Ok(())
    }

    fn accept_body(
        &self,
        branch: &Branch,
        block_index: usize,
        height: u32,
        fork_height: u32,
        branch_txs: &mut HashMap<Hash256, (usize, usize)>,
        branch_spent: &mut HashSet<OutPoint>,
    ) -> Result<BlockPrevouts, Error> {
        let block = &branch.blocks()[block_index];
        let mut block_prevouts: BlockPrevouts = Vec::with_capacity(block.transactions.len() - 1);
        let mut fees = 0i64;

        for (position, tx) in block.transactions.iter().enumerate() {
            if position > 0 {
                let mut tx_prevouts = Vec::with_capacity(tx.vin.len());
                let mut value_in = 0i64;
                for input in &tx.vin {
                    let prevout = self.resolve_prevout(
                        branch,
                        &input.prevout,
                        fork_height,
                        branch_txs,
                    )?;
                    if !branch_spent.insert(input.prevout) {
                        return Err(Error::InvalidTransaction("duplicate spend in branch"));
                    }
                    if prevout.coinbase && height - prevout.height < COINBASE_MATURITY {
                        return Err(Error::InvalidTransaction("premature spend of coinbase"));
                    }
                    value_in = value_in
                        .checked_add(prevout.value)
                        .filter(|total| money_range(*total))
                        .ok_or(Error::InvalidTransaction("input value out of range"))?;
                    tx_prevouts.push(prevout);
                }

                let mut value_out = 0i64;
                for output in &tx.vout {
                    value_out = value_out
                        .checked_add(output.value)
                        .filter(|total| money_range(*total))
                        .ok_or(Error::InvalidTransaction("output value out of range"))?;
                }
                if value_in < value_out {
                    return Err(Error::InvalidTransaction("insufficient input value"));
                }
                fees = fees
                    .checked_add(value_in - value_out)
                    .filter(|total| money_range(*total))
                    .ok_or(Error::InvalidTransaction("fee out of range"))?;
                block_prevouts.push(tx_prevouts);
            }
            branch_txs.insert(tx.txid(), (block_index, position));
        }

        let coinbase_out: i64 = block.transactions[0]
            .vout
            .iter()
            .map(|output| output.value)
            .sum();
        let subsidy = block_subsidy(height, &self.params.consensus);
        if coinbase_out > subsidy.saturating_add(fees) {
            return Err(Error::InvalidBlock("coinbase claims excess value"));
        }

        Ok(block_prevouts)
    }

    fn resolve_prevout(
        &self,
        branch: &Branch,
        outpoint: &OutPoint,
        fork_height: u32,
        branch_txs: &HashMap<Hash256, (usize, usize)>,
    ) -> Result<Prevout, Error> {
        if let Some((block_index, position)) = branch_txs.get(&outpoint.hash) {
            let fork = branch.height().ok_or(Error::OperationFailed)?;
            let tx = &branch.blocks()[*block_index].transactions[*position];
            let output = tx
                .vout
                .get(outpoint.index as usize)
                .ok_or(Error::InvalidTransaction("input not found"))?;
            return Ok(Prevout {
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
                height: fork + 1 + *block_index as u32,
                coinbase: *position == 0,
            });
        }

        let entry = self
            .chain
            .get_output(outpoint, fork_height)?
            .ok_or(Error::InvalidTransaction("input not found"))?;
        // A spend above the fork belongs to the branch being displaced.
        if entry.spender_height != NOT_SPENT && entry.spender_height <= fork_height {
            return Err(Error::InvalidTransaction("input already spent"));
        }
        Ok(Prevout {
            value: entry.output.value,
            script_pubkey: entry.output.script_pubkey,
            height: entry.height,
            coinbase: entry.position == 0,
        })
    }

    // Stage three: script validation, transaction-parallel.
    //-------------------------------------------------------------------------

    pub fn connect(&self, branch: &Branch, prevouts: &BranchPrevouts) -> Result<(), Error> {
        if self.stopped() {
            return Err(Error::ServiceStopped);
        }

        // Flags were recorded per block by the accept stage.
        let mut flags: Vec<ForkFlags> = Vec::with_capacity(branch.len());
        for block in branch.blocks() {
            let context = block
                .validation
                .lock()
                .ok()
                .and_then(|validation| validation.context.clone())
                .ok_or(Error::OperationFailed)?;
            flags.push(context.flags);
        }

        let failure: Mutex<Option<Error>> = Mutex::new(None);
        let verifier = self.verifier.as_ref();
        let stopped = self.stopped.as_ref();

        self.dispatch.priority_scope(|scope| {
            for (block_index, block) in branch.blocks().iter().enumerate() {
                let block_flags = flags[block_index];
                for (offset, tx) in block.transactions.iter().skip(1).enumerate() {
                    let tx_prevouts = &prevouts[block_index][offset];
                    let failure = &failure;
                    scope.spawn(move |_| {
                        if stopped.load(Ordering::Acquire) {
                            return;
                        }
                        if let Ok(guard) = failure.lock() {
                            if guard.is_some() {
                                return;
                            }
                        }
                        for (input_index, prevout) in tx_prevouts.iter().enumerate() {
                            let result = verifier.verify_input(
                                tx,
                                input_index,
                                &prevout.script_pubkey,
                                prevout.value,
                                block_flags,
                            );
                            if let Err(err) = result {
                                if let Ok(mut guard) = failure.lock() {
                                    guard.get_or_insert(Error::InvalidScript(script_reason(err)));
                                }
                                return;
                            }
                        }
                    });
                }
            }
        });

        if self.stopped() {
            return Err(Error::ServiceStopped);
        }
        match failure.into_inner() {
            Ok(Some(err)) => Err(err),
            Ok(None) => Ok(()),
            Err(_) => Err(Error::OperationFailed),
        }
    }
}
