//! Pool of disconnected and competing blocks awaiting organization.

use std::collections::HashMap;
use std::sync::Arc;

use keeld_consensus::Hash256;
use keeld_primitives::Block;

use crate::branch::Branch;

/// Height hint for a block whose chain position is unknown (orphans).
pub const UNKNOWN_HEIGHT: u32 = 0;

struct PoolEntry {
    block: Arc<Block>,
    /// Candidate height, `UNKNOWN_HEIGHT` for orphans.
    height: u32,
    /// Insertion stamp, used as the eviction tie-break.
    stamp: u64,
}

pub struct BlockPool {
    capacity: usize,
    reorganization_limit: u32,
    entries: HashMap<Hash256, PoolEntry>,
    /// Parent hash to pooled children, for forward path extension.
    children: HashMap<Hash256, Vec<Hash256>>,
    clock: u64,
}

impl BlockPool {
    pub fn new(capacity: usize, reorganization_limit: u32) -> Self {
        Self {
            capacity,
            reorganization_limit,
            entries: HashMap::new(),
            children: HashMap::new(),
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    /// Insert a block keyed by hash, if not already present.
    pub fn add(&mut self, block: Arc<Block>, height: u32) {
        let hash = block.hash();
        if self.entries.contains_key(&hash) {
            return;
        }
        self.clock += 1;
        let parent = block.header.prev_block;
        self.children.entry(parent).or_default().push(hash);
        self.entries.insert(
            hash,
            PoolEntry {
                block,
                height,
                stamp: self.clock,
            },
        );
        self.enforce_capacity();
    }

    /// Insert a newest-first block list, `top_height` being the height of
    /// the first entry. Used to re-pool a displaced chain segment.
    pub fn add_all(&mut self, blocks: &[Arc<Block>], top_height: u32) {
        for (offset, block) in blocks.iter().enumerate() {
            self.add(Arc::clone(block), top_height - offset as u32);
        }
    }

    /// Delete exactly the given blocks, used after a commit.
    pub fn remove(&mut self, blocks: &[Arc<Block>]) {
        for block in blocks {
            self.remove_hash(&block.hash());
        }
    }

    fn remove_hash(&mut self, hash: &Hash256) {
        let Some(entry) = self.entries.remove(hash) else {
            return;
        };
        let parent = entry.block.header.prev_block;
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|sibling| sibling != hash);
            if siblings.is_empty() {
                self.children.remove(&parent);
            }
        }
    }

    /// Evict entries more than the reorganization limit below the new top.
    pub fn prune(&mut self, top_height: u32) {
        let expired: Vec<Hash256> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.height != UNKNOWN_HEIGHT
                    && top_height.saturating_sub(entry.height) > self.reorganization_limit
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            self.remove_hash(&hash);
        }
        self.enforce_capacity();
    }

    fn enforce_capacity(&mut self) {
        while self.capacity > 0 && self.entries.len() > self.capacity {
            // Deepest first; orphans and older arrivals go before newer ones.
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.height, entry.stamp))
                .map(|(hash, _)| *hash);
            match victim {
                Some(hash) => self.remove_hash(&hash),
                None => break,
            }
        }
    }

    /// Assemble the candidate branch containing `block`.
    ///
    /// Walks previous-hash links backwards through the pool to the deepest
    /// known ancestor, then forward through pooled descendants of `block`.
    /// Returns an empty branch if the block is already pooled. The caller
    /// resolves whether the root parent is on the chain.
    pub fn get_path(&self, block: Arc<Block>) -> Branch {
        let mut branch = Branch::new();
        if self.contains(&block.hash()) {
            return branch;
        }

        let mut reversed = vec![Arc::clone(&block)];
        let mut cursor = block.header.prev_block;
        while let Some(entry) = self.entries.get(&cursor) {
            reversed.push(Arc::clone(&entry.block));
            cursor = entry.block.header.prev_block;
        }
        for ancestor in reversed.into_iter().rev() {
            branch.push(ancestor);
        }

        let mut top_hash = block.hash();
        while let Some(children) = self.children.get(&top_hash) {
            let Some(next) = children.iter().min() else {
                break;
            };
            let Some(entry) = self.entries.get(next) else {
                break;
            };
            branch.push(Arc::clone(&entry.block));
            top_hash = *next;
        }

        branch
    }

    /// Remove hashes already known to the pool from an inventory.
    pub fn filter(&self, inventory: &mut Vec<Hash256>) {
        inventory.retain(|hash| !self.entries.contains_key(hash));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeld_primitives::block::{BlockHeader, CURRENT_VERSION};

    fn block_after(parent: Hash256, nonce: u32) -> Arc<Block> {
        Arc::new(Block::new(
            BlockHeader {
                version: CURRENT_VERSION,
                prev_block: parent,
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0x207f_ffff,
                nonce,
            },
            Vec::new(),
        ))
    }

    #[test]
    fn add_is_idempotent_by_hash() {
        let mut pool = BlockPool::new(10, 8);
        let block = block_after([0x01; 32], 0);
        pool.add(block.clone(), 5);
        pool.add(block.clone(), 9);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&block.hash()));
    }

    #[test]
    fn path_walks_ancestors_and_descendants() {
        let mut pool = BlockPool::new(10, 8);
        let a = block_after([0x01; 32], 0);
        let b = block_after(a.hash(), 1);
        let c = block_after(b.hash(), 2);
        let d = block_after(c.hash(), 3);
        pool.add(a.clone(), 0);
        pool.add(b.clone(), 0);
        pool.add(d.clone(), 0);

        // Organizing c bridges the pooled ancestors [a, b] and descendant d.
        let branch = pool.get_path(c.clone());
        let hashes: Vec<Hash256> = branch.blocks().iter().map(|block| block.hash()).collect();
        assert_eq!(hashes, vec![a.hash(), b.hash(), c.hash(), d.hash()]);
        assert_eq!(branch.hash(), Some([0x01; 32]));

        // A block already pooled yields an empty branch (duplicate).
        assert!(pool.get_path(b).is_empty());
    }

    #[test]
    fn prune_honors_depth_and_keeps_orphans() {
        let mut pool = BlockPool::new(10, 4);
        let deep = block_after([0x01; 32], 0);
        let near = block_after([0x02; 32], 1);
        let orphan = block_after([0x03; 32], 2);
        pool.add(deep.clone(), 10);
        pool.add(near.clone(), 18);
        pool.add(orphan.clone(), UNKNOWN_HEIGHT);

        pool.prune(20);
        assert!(!pool.contains(&deep.hash()));
        assert!(pool.contains(&near.hash()));
        assert!(pool.contains(&orphan.hash()));
    }

    #[test]
    fn capacity_evicts_deepest_first() {
        let mut pool = BlockPool::new(2, 100);
        let shallow = block_after([0x01; 32], 0);
        let deeper = block_after([0x02; 32], 1);
        let newest = block_after([0x03; 32], 2);
        pool.add(shallow.clone(), 50);
        pool.add(deeper.clone(), 10);
        pool.add(newest.clone(), 60);

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&deeper.hash()));
        assert!(pool.contains(&shallow.hash()));
        assert!(pool.contains(&newest.hash()));
    }

    #[test]
    fn filter_is_idempotent() {
        let mut pool = BlockPool::new(10, 8);
        let known = block_after([0x01; 32], 0);
        pool.add(known.clone(), 0);

        let mut inventory = vec![known.hash(), [0xaa; 32]];
        pool.filter(&mut inventory);
        assert_eq!(inventory, vec![[0xaa; 32]]);
        pool.filter(&mut inventory);
        assert_eq!(inventory, vec![[0xaa; 32]]);
    }
}
