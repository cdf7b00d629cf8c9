//! Header proof-of-work checks.

use keeld_consensus::Hash256;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    Compact(CompactError),
    TargetAboveLimit,
    HashAboveTarget,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::Compact(err) => write!(f, "{err}"),
            PowError::TargetAboveLimit => write!(f, "claimed target above proof-of-work limit"),
            PowError::HashAboveTarget => write!(f, "block hash does not satisfy claimed target"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Verify `hash` satisfies the compact `bits` and that `bits` does not claim
/// an easier target than the network permits.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    pow_limit: &Hash256,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    let limit = U256::from_little_endian(pow_limit);
    if target.is_zero() || target > limit {
        return Err(PowError::TargetAboveLimit);
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}
