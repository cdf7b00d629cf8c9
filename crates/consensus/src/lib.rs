//! Consensus parameters and chain activation state.

pub mod constants;
pub mod context;
pub mod money;
pub mod params;
pub mod rewards;

pub use context::{ChainContext, ForkFlags};
pub use params::{chain_params, ChainParams, ConsensusParams, Network};
pub use rewards::block_subsidy;

/// A 32-byte hash in little-endian byte order, matching the wire encoding.
pub type Hash256 = [u8; 32];

/// The all-zero hash, used as the null/parentless sentinel.
pub const NULL_HASH: Hash256 = [0u8; 32];
