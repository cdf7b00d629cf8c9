//! Chain-context population.
//!
//! Produces the activation state for each branch block: expected difficulty,
//! median time past, soft-fork flags, and the sampled minimum version.
//! Ancestors are read branch-first, then from the store below the fork
//! point. A cached tip window turns tip extension into a promotion instead
//! of a full regeneration.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use keeld_chainstate::ChainStore;
use keeld_consensus::constants::{BIP34_VERSION, BIP65_VERSION, BIP66_VERSION, FIRST_VERSION, MEDIAN_TIME_SPAN};
use keeld_consensus::{ChainContext, ChainParams, ForkFlags, Hash256};
use keeld_pow::difficulty::{get_next_work_required, median_time_past, HeaderInfo};
use keeld_primitives::Block;
use keeld_storage::Backend;

use crate::branch::Branch;
use crate::error::Error;

struct TipWindows {
    tip_hash: Hash256,
    base_height: u32,
    headers: VecDeque<HeaderInfo>,
}

impl TipWindows {
    fn get(&self, height: u32) -> Option<HeaderInfo> {
        let offset = height.checked_sub(self.base_height)? as usize;
        self.headers.get(offset).copied()
    }

    fn advance(&mut self, hash: Hash256, info: HeaderInfo, window_len: usize) {
        self.tip_hash = hash;
        self.headers.push_back(info);
        while self.headers.len() > window_len {
            self.headers.pop_front();
            self.base_height += 1;
        }
    }
}

pub struct Populator<S> {
    chain: Arc<ChainStore<S>>,
    params: ChainParams,
    cached: RwLock<Option<TipWindows>>,
}

fn header_info(block: &Block, height: u32) -> HeaderInfo {
    HeaderInfo {
        height: i64::from(height),
        time: i64::from(block.header.time),
        bits: block.header.bits,
        version: block.header.version,
    }
}

impl<S: Backend> Populator<S> {
    pub fn new(chain: Arc<ChainStore<S>>, params: ChainParams) -> Self {
        Self {
            chain,
            params,
            cached: RwLock::new(None),
        }
    }

    /// Ancestor headers required by the widest consensus window.
    fn window_len(&self) -> usize {
        let consensus = &self.params.consensus;
        (consensus.retarget_interval as usize + 1)
            .max(consensus.version_sample_window as usize)
            .max(MEDIAN_TIME_SPAN)
    }

    /// The context active for the branch block at `index`.
    pub fn populate(&self, branch: &Branch, index: usize) -> Result<ChainContext, Error> {
        let fork_height = branch.height().ok_or(Error::OperationFailed)?;
        let target = fork_height + 1 + index as u32;
        let window = self.window_len() as u32;
        let start = target.saturating_sub(window);

        let mut headers = Vec::with_capacity(self.window_len());
        if start <= fork_height {
            for height in start..=fork_height {
                headers.push(self.stored_header(height)?);
            }
        }
        for (offset, block) in branch.blocks()[..index].iter().enumerate() {
            let height = fork_height + 1 + offset as u32;
            if height < start {
                continue;
            }
            headers.push(header_info(block, height));
        }

        self.context_at(&headers, target)
    }

    /// Header at a main-chain height, served from the cached tip window when
    /// it covers that height. Heights at or below a fork point are shared by
    /// every branch, so the cache is valid regardless of which branch is
    /// being populated.
    fn stored_header(&self, height: u32) -> Result<HeaderInfo, Error> {
        if let Ok(guard) = self.cached.read() {
            if let Some(windows) = guard.as_ref() {
                if let Some(info) = windows.get(height) {
                    return Ok(info);
                }
            }
        }
        self.chain
            .get_header_info(height)?
            .ok_or(Error::OperationFailed)
    }

    fn context_at(&self, headers: &[HeaderInfo], height: u32) -> Result<ChainContext, Error> {
        let consensus = &self.params.consensus;
        let next_bits =
            get_next_work_required(headers, consensus).map_err(|_| Error::OperationFailed)?;
        let median_time_past = if headers.is_empty() {
            0
        } else {
            median_time_past(headers, headers.len() - 1) as u32
        };

        let sample = consensus.version_sample_window as usize;
        let window = &headers[headers.len().saturating_sub(sample)..];
        let mut minimum_version = FIRST_VERSION;
        for version in [BIP34_VERSION, BIP66_VERSION, BIP65_VERSION] {
            let count = window
                .iter()
                .filter(|header| header.version >= version)
                .count();
            if count >= consensus.version_enforce_threshold as usize {
                minimum_version = version;
            }
        }

        let mut flags = ForkFlags::NONE;
        if height >= consensus.bip34_height {
            flags |= ForkFlags::BIP34;
        }
        if height >= consensus.bip66_height {
            flags |= ForkFlags::BIP66;
        }
        if height >= consensus.bip65_height {
            flags |= ForkFlags::BIP65 | ForkFlags::CLEAN_STACK;
        }

        Ok(ChainContext {
            height,
            flags,
            next_bits,
            median_time_past,
            minimum_version,
        })
    }

    /// Update the cached tip window after a commit. A pure tip extension is
    /// promoted by shifting the windows forward; anything else rebuilds from
    /// the store.
    pub fn refresh(&self, fork_height: u32, incoming: &[Arc<Block>]) {
        let Ok(mut guard) = self.cached.write() else {
            return;
        };
        let window_len = self.window_len();
        let promotable = match (&*guard, incoming.first()) {
            (Some(windows), Some(first)) => first.header.prev_block == windows.tip_hash,
            _ => false,
        };
        if promotable {
            let windows = guard.as_mut().expect("promotable implies cached");
            for (offset, block) in incoming.iter().enumerate() {
                let height = fork_height + 1 + offset as u32;
                windows.advance(block.hash(), header_info(block, height), window_len);
            }
        } else {
            *guard = self.bootstrap();
        }
    }

    fn bootstrap(&self) -> Option<TipWindows> {
        let tip = self.chain.get_last_height().ok()??;
        let tip_hash = self.chain.get_hash(tip).ok()??;
        let window = self.window_len() as u32;
        let base_height = (tip + 1).saturating_sub(window);
        let mut headers = VecDeque::with_capacity(self.window_len());
        for height in base_height..=tip {
            headers.push_back(self.chain.get_header_info(height).ok()??);
        }
        Some(TipWindows {
            tip_hash,
            base_height,
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeld_consensus::{chain_params, Network};
    use keeld_primitives::block::{BlockHeader, CURRENT_VERSION};
    use keeld_storage::memory::MemoryStore;

    fn easy_block(parent: Hash256, time: u32) -> Arc<Block> {
        Arc::new(Block::new(
            BlockHeader {
                version: CURRENT_VERSION,
                prev_block: parent,
                merkle_root: [0u8; 32],
                time,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            Vec::new(),
        ))
    }

    fn populated_chain(length: u32) -> (Arc<ChainStore<MemoryStore>>, Vec<Arc<Block>>) {
        let chain = Arc::new(ChainStore::new(Arc::new(MemoryStore::new())));
        let mut parent = [0u8; 32];
        let mut blocks = Vec::new();
        for height in 0..length {
            let block = easy_block(parent, 1_600_000_000 + height * 600);
            chain.insert(&block, height).expect("insert");
            parent = block.hash();
            blocks.push(block);
        }
        (chain, blocks)
    }

    #[test]
    fn context_reflects_branch_and_store_ancestors() {
        let (chain, blocks) = populated_chain(12);
        let params = chain_params(Network::Regtest);
        let populator = Populator::new(Arc::clone(&chain), params);

        let mut branch = Branch::new();
        let side = easy_block(blocks[11].hash(), 1_600_000_000 + 12 * 600);
        branch.push(Arc::clone(&side));
        branch.set_height(11);

        let context = populator.populate(&branch, 0).expect("context");
        assert_eq!(context.height, 12);
        assert_eq!(context.next_bits, 0x207f_ffff);
        // Median of the last eleven ancestor timestamps.
        assert_eq!(context.median_time_past, 1_600_000_000 + 6 * 600);
        assert!(context.flags.contains(ForkFlags::BIP34));

        // The next branch block sees the side block as its ancestor.
        let deeper = easy_block(side.hash(), 1_600_000_000 + 13 * 600);
        branch.push(deeper);
        let context = populator.populate(&branch, 1).expect("context");
        assert_eq!(context.height, 13);
        assert_eq!(context.median_time_past, 1_600_000_000 + 7 * 600);
    }

    #[test]
    fn refresh_promotes_pure_extension() {
        let (chain, blocks) = populated_chain(4);
        let params = chain_params(Network::Regtest);
        let populator = Populator::new(Arc::clone(&chain), params);
        populator.refresh(0, &[]);

        let next = easy_block(blocks[3].hash(), 1_600_000_000 + 4 * 600);
        chain.insert(&next, 4).expect("insert");
        populator.refresh(3, &[Arc::clone(&next)]);

        let cached = populator.cached.read().expect("cache");
        let windows = cached.as_ref().expect("bootstrapped");
        assert_eq!(windows.tip_hash, next.hash());
        assert_eq!(windows.get(4).expect("tip header").bits, 0x207f_ffff);
    }
}
