//! Block-chain organization: candidate pools, branch validation, and atomic
//! reorganization of the stored chain toward greatest cumulative work.

pub mod block_pool;
pub mod branch;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod organizer;
pub mod populate;
pub mod settings;
pub mod subscriber;
pub mod tx_organizer;
pub mod validate;

pub use block_pool::BlockPool;
pub use branch::Branch;
pub use dispatch::Dispatcher;
pub use error::Error;
pub use metrics::{OrganizeMetrics, OrganizeMetricsSnapshot};
pub use organizer::BlockOrganizer;
pub use settings::Settings;
pub use subscriber::{ReorganizePayload, Subscriber, TransactionPayload};
pub use tx_organizer::TransactionOrganizer;
pub use validate::BlockValidator;

use std::sync::{Arc, Mutex};

use keeld_chainstate::ChainStore;
use keeld_consensus::{ChainParams, Hash256};
use keeld_primitives::{Block, Transaction};
use keeld_script::{Interpreter, ScriptVerifier};
use keeld_storage::Backend;

/// The assembled chain service: one store, one writer mutex, two organizers.
///
/// Owns the store handle and the dispatcher; the organizers hold handles to
/// the store, never the other way around.
pub struct BlockChain<S: Backend + 'static> {
    chain: Arc<ChainStore<S>>,
    dispatch: Arc<Dispatcher>,
    organizer: Arc<BlockOrganizer<S>>,
    transactions: Arc<TransactionOrganizer<S>>,
}

impl<S: Backend + 'static> BlockChain<S> {
    pub fn new(store: Arc<S>, params: ChainParams, settings: Settings) -> Result<Self, Error> {
        Self::with_verifier(store, params, settings, Arc::new(Interpreter))
    }

    pub fn with_verifier(
        store: Arc<S>,
        params: ChainParams,
        settings: Settings,
        verifier: Arc<dyn ScriptVerifier>,
    ) -> Result<Self, Error> {
        let chain = Arc::new(ChainStore::new(store));
        let dispatch = Arc::new(Dispatcher::new(&settings)?);
        let mutex = Arc::new(Mutex::new(()));
        let organizer = Arc::new(BlockOrganizer::new(
            Arc::clone(&chain),
            Arc::clone(&dispatch),
            params,
            settings,
            verifier,
            Arc::clone(&mutex),
        ));
        let transactions = Arc::new(TransactionOrganizer::new(
            Arc::clone(&chain),
            Arc::clone(&dispatch),
            mutex,
        ));
        Ok(Self {
            chain,
            dispatch,
            organizer,
            transactions,
        })
    }

    pub fn start(&self) {
        self.organizer.start();
        self.transactions.start();
    }

    /// Stop both organizers; stop notifications fire exactly once.
    pub fn stop(&self) {
        self.organizer.stop();
        self.transactions.stop();
    }

    /// Stop, join the worker pools, and close the store. Idempotent.
    pub fn close(&self) -> Result<(), Error> {
        self.stop();
        self.dispatch.close();
        self.chain.close()?;
        Ok(())
    }

    pub fn organize_block(&self, block: Arc<Block>) -> Result<(), Error> {
        self.organizer.organize(block)
    }

    pub fn organize_transaction(&self, tx: Arc<Transaction>) -> Result<(), Error> {
        self.transactions.organize(tx)
    }

    pub fn subscribe_reorganize(
        &self,
        handler: impl Fn(ReorganizePayload) + Send + Sync + 'static,
    ) {
        self.organizer.subscribe_reorganize(handler);
    }

    pub fn subscribe_transaction(
        &self,
        handler: impl Fn(TransactionPayload) + Send + Sync + 'static,
    ) {
        self.transactions.subscribe_transaction(handler);
    }

    /// Remove hashes pooled as candidates from an inventory.
    pub fn filter_orphans(&self, inventory: &mut Vec<Hash256>) {
        self.organizer.filter(inventory);
    }

    /// The sequence-locked query surface.
    pub fn chain(&self) -> &Arc<ChainStore<S>> {
        &self.chain
    }

    pub fn organizer(&self) -> &Arc<BlockOrganizer<S>> {
        &self.organizer
    }

    pub fn metrics(&self) -> OrganizeMetricsSnapshot {
        self.organizer.metrics().snapshot()
    }
}
