//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: u32 = 100;
/// The number of recent headers sampled for the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Maximum tolerated clock skew for a block timestamp, in seconds (network rule).
pub const MAX_TIME_OFFSET: i64 = 2 * 60 * 60;
/// The minimum size of a coinbase input script (network rule).
pub const MIN_COINBASE_SIZE: usize = 2;
/// The maximum size of a coinbase input script (network rule).
pub const MAX_COINBASE_SIZE: usize = 100;
/// Block subsidy halves every this many blocks (network rule).
pub const SUBSIDY_HALVING_INTERVAL: u32 = 210_000;
/// Retarget bound: the new timespan is clamped within a factor of this.
pub const RETARGETING_FACTOR: i64 = 4;
/// The minimum block version once height-in-coinbase is enforced.
pub const BIP34_VERSION: i32 = 2;
/// The minimum block version once strict DER signatures are enforced.
pub const BIP66_VERSION: i32 = 3;
/// The minimum block version once checklocktimeverify is enforced.
pub const BIP65_VERSION: i32 = 4;
/// The first block version, never rejected by sampling.
pub const FIRST_VERSION: i32 = 1;
