//! Block organizer: the single writer over the chain store.
//!
//! `organize` runs under a process-wide writer mutex shared with the
//! transaction organizer. The accept/connect/commit pipeline executes on
//! the priority pool while the calling thread waits on a one-shot
//! completion barrier, so pool workers are never blocked on the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::bounded;
use keeld_chainstate::ChainStore;
use keeld_consensus::{ChainParams, Hash256};
use keeld_primitives::Block;
use keeld_script::ScriptVerifier;
use keeld_storage::Backend;
use tracing::{debug, error, info};

use crate::block_pool::{BlockPool, UNKNOWN_HEIGHT};
use crate::branch::Branch;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::metrics::OrganizeMetrics;
use crate::populate::Populator;
use crate::settings::Settings;
use crate::subscriber::{ReorganizePayload, Subscriber};
use crate::validate::BlockValidator;

struct Inner<S> {
    chain: Arc<ChainStore<S>>,
    settings: Settings,
    pool: Mutex<BlockPool>,
    populator: Populator<S>,
    validator: BlockValidator<S>,
    subscriber: Subscriber<ReorganizePayload>,
    metrics: OrganizeMetrics,
    stopped: Arc<AtomicBool>,
}

pub struct BlockOrganizer<S> {
    inner: Arc<Inner<S>>,
    mutex: Arc<Mutex<()>>,
    dispatch: Arc<Dispatcher>,
}

impl<S: Backend + 'static> BlockOrganizer<S> {
    pub fn new(
        chain: Arc<ChainStore<S>>,
        dispatch: Arc<Dispatcher>,
        params: ChainParams,
        settings: Settings,
        verifier: Arc<dyn ScriptVerifier>,
        mutex: Arc<Mutex<()>>,
    ) -> Self {
        let stopped = Arc::new(AtomicBool::new(true));
        let inner = Inner {
            pool: Mutex::new(BlockPool::new(
                settings.block_pool_capacity,
                settings.reorganization_limit,
            )),
            populator: Populator::new(Arc::clone(&chain), params.clone()),
            validator: BlockValidator::new(
                Arc::clone(&chain),
                params,
                verifier,
                Arc::clone(&dispatch),
                Arc::clone(&stopped),
            ),
            subscriber: Subscriber::new(Arc::clone(&dispatch)),
            metrics: OrganizeMetrics::default(),
            chain,
            settings,
            stopped,
        };
        Self {
            inner: Arc::new(inner),
            mutex,
            dispatch,
        }
    }

    pub fn start(&self) {
        self.inner.stopped.store(false, Ordering::Release);
    }

    /// Stop accepting work and fire the stop notification exactly once.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.subscriber.stop(ReorganizePayload::stopped());
    }

    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn subscribe_reorganize(&self, handler: impl Fn(ReorganizePayload) + Send + Sync + 'static) {
        self.inner.subscriber.subscribe(handler);
    }

    /// Remove pool-known hashes from an inventory.
    pub fn filter(&self, inventory: &mut Vec<Hash256>) {
        if let Ok(pool) = self.inner.pool.lock() {
            pool.filter(inventory);
        }
    }

    pub fn metrics(&self) -> &OrganizeMetrics {
        &self.inner.metrics
    }

    /// Validate `block` against the chain and commit the heaviest branch.
    ///
    /// The caller's result is produced after the critical section ends.
    pub fn organize(&self, block: Arc<Block>) -> Result<(), Error> {
        let guard = self.mutex.lock().map_err(|_| Error::OperationFailed)?;
        let result = self.organize_locked(block);
        drop(guard);
        if matches!(
            result,
            Err(Error::InvalidHeader(_))
                | Err(Error::InvalidBlock(_))
                | Err(Error::InvalidTransaction(_))
                | Err(Error::InvalidScript(_))
        ) {
            self.inner.metrics.record_rejected();
        }
        result
    }

    fn organize_locked(&self, block: Arc<Block>) -> Result<(), Error> {
        let inner = &self.inner;
        if self.stopped() {
            return Err(Error::ServiceStopped);
        }

        inner.metrics.record_checked();
        inner.validator.check(&block)?;

        let hash = block.hash();
        let mut branch = {
            let pool = inner.pool.lock().map_err(|_| Error::OperationFailed)?;
            pool.get_path(Arc::clone(&block))
        };

        // This rejects on any hash-equal block anywhere, not only at the
        // branch point, so a hash collision splits the network on order of
        // arrival. Kept to match the established network behavior.
        if branch.is_empty() || inner.chain.block_exists(&hash)? {
            return Err(Error::DuplicateBlock);
        }

        let parent_hash = branch.hash().ok_or(Error::OperationFailed)?;
        let Some(parent_height) = inner.chain.get_height(&parent_hash)? else {
            let mut pool = inner.pool.lock().map_err(|_| Error::OperationFailed)?;
            pool.add(block, UNKNOWN_HEIGHT);
            debug!(block = %keeld_primitives::hash_to_hex(&hash), "pooled orphan block");
            return Err(Error::OrphanBlock);
        };
        branch.set_height(parent_height);

        // Completion barrier: the pipeline advances on priority workers
        // while this thread suspends, then delivers outside the pool.
        let (sender, receiver) = bounded::<Result<(), Error>>(1);
        let pipeline = Arc::clone(inner);
        let branch = Arc::new(branch);
        self.dispatch.spawn_priority(move || {
            let result = pipeline.run_pipeline(&branch);
            let _ = sender.send(result);
        });

        receiver.recv().unwrap_or(Err(Error::ServiceStopped))
    }
}

impl<S: Backend> Inner<S> {
    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn run_pipeline(&self, branch: &Branch) -> Result<(), Error> {
        if self.stopped() {
            return Err(Error::ServiceStopped);
        }
        let validate_start = Instant::now();

        let prevouts = self.validator.accept(branch, &self.populator)?;
        self.metrics.record_accepted();
        if self.stopped() {
            return Err(Error::ServiceStopped);
        }

        self.validator.connect(branch, &prevouts)?;
        self.metrics.record_connected(validate_start.elapsed());
        if self.stopped() {
            return Err(Error::ServiceStopped);
        }

        let fork = branch.fork_point().ok_or(Error::OperationFailed)?;
        let top_height = fork.height + branch.len() as u32;

        // The branch is valid either way; without enough work it only pools.
        let maximum = branch.work();
        let threshold = self.chain.get_branch_work(&maximum, fork.height + 1)?;
        if maximum <= threshold {
            let mut pool = self.pool.lock().map_err(|_| Error::OperationFailed)?;
            for (offset, candidate) in branch.blocks().iter().enumerate() {
                pool.add(Arc::clone(candidate), fork.height + 1 + offset as u32);
            }
            self.metrics.record_pooled();
            debug!(height = top_height, "pooled branch with insufficient work");
            return Err(Error::InsufficientWork);
        }

        let commit_start = Instant::now();
        let outgoing = match self.chain.reorganize(&fork, branch.blocks()) {
            Ok(outgoing) => outgoing,
            Err(err) => {
                error!(%err, "fatal: failure writing branch to store");
                return Err(err.into());
            }
        };
        self.metrics.record_committed(commit_start.elapsed());

        {
            let mut pool = self.pool.lock().map_err(|_| Error::OperationFailed)?;
            pool.remove(branch.blocks());
            pool.prune(top_height);
            // Displaced blocks are newest-first; re-pool with their heights.
            pool.add_all(&outgoing, fork.height + outgoing.len() as u32);
        }

        self.populator.refresh(fork.height, branch.blocks());

        if self.settings.relay_transactions {
            // Displaced transactions return to the unconfirmed pool.
            for displaced in &outgoing {
                for tx in displaced.transactions.iter().skip(1) {
                    let _ = self.chain.push_transaction(tx);
                }
            }
        }

        if let Some(top) = branch.top() {
            if let Ok(mut validation) = top.validation.lock() {
                validation.start_notify = Some(Instant::now());
            }
        }

        info!(
            fork_height = fork.height,
            incoming = branch.len(),
            outgoing = outgoing.len(),
            top_height,
            "chain reorganized"
        );
        self.subscriber.relay(ReorganizePayload {
            code: None,
            branch_height: fork.height,
            incoming: Arc::new(branch.blocks().to_vec()),
            outgoing: Arc::new(outgoing),
        });

        Ok(())
    }
}
