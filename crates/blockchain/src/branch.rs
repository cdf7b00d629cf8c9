//! A height-anchored chain of candidate blocks rooted at a stored block.

use std::sync::Arc;

use keeld_chainstate::ForkPoint;
use keeld_consensus::Hash256;
use keeld_pow::difficulty::block_proof;
use keeld_primitives::Block;
use primitive_types::U256;

#[derive(Debug, Default)]
pub struct Branch {
    /// Height of the on-chain parent, once resolved.
    height: Option<u32>,
    blocks: Vec<Arc<Block>>,
}

impl Branch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    pub fn top(&self) -> Option<&Arc<Block>> {
        self.blocks.last()
    }

    /// Append a block; it must link to the current top (or start the branch).
    pub fn push(&mut self, block: Arc<Block>) -> bool {
        let links = match self.blocks.last() {
            Some(top) => block.header.prev_block == top.hash(),
            None => true,
        };
        if links {
            self.blocks.push(block);
        }
        links
    }

    /// The fork-point height. May be set at most once.
    pub fn set_height(&mut self, height: u32) {
        debug_assert!(self.height.is_none(), "branch height already set");
        self.height = Some(height);
    }

    pub fn height(&self) -> Option<u32> {
        self.height
    }

    /// Hash of the on-chain parent: the first block's previous hash.
    pub fn hash(&self) -> Option<Hash256> {
        self.blocks.first().map(|block| block.header.prev_block)
    }

    pub fn top_height(&self) -> Option<u32> {
        Some(self.height? + self.blocks.len() as u32)
    }

    pub fn fork_point(&self) -> Option<ForkPoint> {
        Some(ForkPoint {
            hash: self.hash()?,
            height: self.height?,
        })
    }

    /// Cumulative proof claimed by the branch blocks.
    pub fn work(&self) -> U256 {
        self.blocks
            .iter()
            .map(|block| block_proof(block.header.bits).unwrap_or_default())
            .fold(U256::zero(), |total, proof| total.saturating_add(proof))
    }
}
