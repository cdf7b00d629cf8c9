//! Transaction organizer: unconfirmed admission and notification.
//!
//! Shares the block organizer's writer mutex so there is a single writer
//! over the store at any time. Admission policy (fee scoring, replacement,
//! eviction) lives outside this crate; this is the organize/notify seam
//! the block organizer and network layer need.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use keeld_chainstate::{ChainStore, NOT_SPENT, UNCONFIRMED};
use keeld_consensus::money::money_range;
use keeld_primitives::Transaction;
use keeld_storage::Backend;

use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::subscriber::{Subscriber, TransactionPayload};

pub struct TransactionOrganizer<S> {
    chain: Arc<ChainStore<S>>,
    mutex: Arc<Mutex<()>>,
    stopped: AtomicBool,
    subscriber: Subscriber<TransactionPayload>,
}

impl<S: Backend + 'static> TransactionOrganizer<S> {
    pub fn new(chain: Arc<ChainStore<S>>, dispatch: Arc<Dispatcher>, mutex: Arc<Mutex<()>>) -> Self {
        Self {
            chain,
            mutex,
            stopped: AtomicBool::new(true),
            subscriber: Subscriber::new(dispatch),
        }
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscriber.stop(TransactionPayload::stopped());
    }

    pub fn subscribe_transaction(
        &self,
        handler: impl Fn(TransactionPayload) + Send + Sync + 'static,
    ) {
        self.subscriber.subscribe(handler);
    }

    pub fn organize(&self, tx: Arc<Transaction>) -> Result<(), Error> {
        let guard = self.mutex.lock().map_err(|_| Error::OperationFailed)?;
        let result = self.organize_locked(&tx);
        drop(guard);
        if result.is_ok() {
            self.subscriber.relay(TransactionPayload {
                code: None,
                transaction: Some(tx),
            });
        }
        result
    }

    fn organize_locked(&self, tx: &Transaction) -> Result<(), Error> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::ServiceStopped);
        }
        if tx.is_coinbase() {
            return Err(Error::InvalidTransaction("coinbase outside a block"));
        }
        if tx.vin.is_empty() || tx.vout.is_empty() {
            return Err(Error::InvalidTransaction("transaction has no inputs or outputs"));
        }

        let mut value_out = 0i64;
        for output in &tx.vout {
            value_out = value_out
                .checked_add(output.value)
                .filter(|total| money_range(*total))
                .ok_or(Error::InvalidTransaction("output value out of range"))?;
        }

        let mut value_in = 0i64;
        for input in &tx.vin {
            let entry = self
                .chain
                .get_output(&input.prevout, UNCONFIRMED)?
                .ok_or(Error::InvalidTransaction("input not found"))?;
            if entry.spender_height != NOT_SPENT {
                return Err(Error::InvalidTransaction("input already spent"));
            }
            value_in = value_in
                .checked_add(entry.output.value)
                .filter(|total| money_range(*total))
                .ok_or(Error::InvalidTransaction("input value out of range"))?;
        }
        if value_in < value_out {
            return Err(Error::InvalidTransaction("insufficient input value"));
        }

        self.chain.push_transaction(tx)?;
        Ok(())
    }
}
