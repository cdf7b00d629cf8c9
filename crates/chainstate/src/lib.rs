//! Fast-chain store: height/hash indexed blocks, transactions with cached
//! spender heights, spend/history/stealth indices, and a sequence-locked
//! reader protocol over any [`keeld_storage::Backend`].

pub mod blocks;
pub mod history;
pub mod queries;
pub mod sequence;
pub mod spends;
pub mod stealth;
pub mod store;
pub mod transactions;

pub use blocks::{BlockRecord, BlockTable};
pub use history::{HistoryRow, HistoryTable};
pub use queries::BlockLocator;
pub use sequence::{SequenceLock, SPIN_SLEEP};
pub use spends::{SpendEntry, SpendTable};
pub use stealth::{StealthRow, StealthTable};
pub use store::{ChainStore, ForkPoint};
pub use transactions::{OutputEntry, TxRecord, TxTable, NOT_SPENT, UNCONFIRMED};

use keeld_primitives::encoding::DecodeError;
use keeld_storage::StoreError;

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    Codec(DecodeError),
    NotFound,
    OperationFailed(&'static str),
    Corrupted,
    Stopped,
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::Codec(err) => write!(f, "undecodable record: {err}"),
            ChainError::NotFound => write!(f, "not found"),
            ChainError::OperationFailed(message) => write!(f, "{message}"),
            ChainError::Corrupted => write!(f, "store is corrupted"),
            ChainError::Stopped => write!(f, "store is closed"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<DecodeError> for ChainError {
    fn from(err: DecodeError) -> Self {
        ChainError::Codec(err)
    }
}

pub(crate) fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

/// Outpoint key, stack-allocated for the common short-key path.
pub(crate) fn outpoint_key(
    outpoint: &keeld_primitives::OutPoint,
) -> smallvec::SmallVec<[u8; 40]> {
    let mut key = smallvec::SmallVec::new();
    key.extend_from_slice(&outpoint.hash);
    key.extend_from_slice(&outpoint.index.to_le_bytes());
    key
}
