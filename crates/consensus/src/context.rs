//! Activation state derived from a block's ancestor window.

use std::ops::{BitOr, BitOrAssign};

/// Set of soft-fork rules active at a given height.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ForkFlags(u32);

impl ForkFlags {
    pub const NONE: ForkFlags = ForkFlags(0);
    /// Coinbase input script must begin with the block height.
    pub const BIP34: ForkFlags = ForkFlags(1);
    /// Strict DER signature encoding.
    pub const BIP66: ForkFlags = ForkFlags(1 << 1);
    /// Checklocktimeverify.
    pub const BIP65: ForkFlags = ForkFlags(1 << 2);
    /// Script evaluation must leave exactly one stack element.
    pub const CLEAN_STACK: ForkFlags = ForkFlags(1 << 3);

    pub fn contains(self, other: ForkFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ForkFlags {
    type Output = ForkFlags;

    fn bitor(self, rhs: ForkFlags) -> ForkFlags {
        ForkFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ForkFlags {
    fn bitor_assign(&mut self, rhs: ForkFlags) {
        self.0 |= rhs.0;
    }
}

/// Consensus activation state for the block at `height`.
///
/// A value object: derived deterministically from the ancestor window and
/// cheap to clone. Produced by the populator, consumed by the validator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainContext {
    /// Height of the block this context validates.
    pub height: u32,
    /// Soft forks active at `height`.
    pub flags: ForkFlags,
    /// Expected compact difficulty for the block at `height`.
    pub next_bits: u32,
    /// Median of the previous eleven block timestamps.
    pub median_time_past: u32,
    /// Lowest block version the sampled window still accepts.
    pub minimum_version: i32,
}
