//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use keeld_consensus::constants::{MEDIAN_TIME_SPAN, RETARGETING_FACTOR};
use keeld_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
    ShortWindow,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::ShortWindow => write!(f, "retarget window not fully available"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
    pub version: i32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = (bits >> 24) as u32;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34
            || (word > 0xff && size > 33)
            || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = ((value.bits() + 7) / 8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Work contributed by a block claiming `bits`: 2^256 / (target + 1).
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    let left = U256::from_little_endian(a);
    let right = U256::from_little_endian(b);
    left.cmp(&right)
}

/// Expected compact bits for the block following `chain.last()`.
///
/// The chain slice must be contiguous by height and, on a retarget boundary,
/// must reach back to the first block of the closing period.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    if chain.is_empty() {
        return Ok(pow_limit_bits);
    }

    ensure_contiguous(chain)?;

    let last = chain.last().expect("checked not empty");
    if params.no_retarget {
        return Ok(last.bits);
    }

    let next_height = last.height + 1;
    let interval = params.retarget_interval as i64;
    if next_height % interval != 0 {
        return Ok(last.bits);
    }

    let first_height = next_height - interval;
    let base_height = chain[0].height;
    if base_height > first_height {
        return Err(DifficultyError::ShortWindow);
    }
    let first = &chain[(first_height - base_height) as usize];

    let mut actual_timespan = last.time - first.time;
    let target_timespan = params.retarget_timespan;
    if actual_timespan < target_timespan / RETARGETING_FACTOR {
        actual_timespan = target_timespan / RETARGETING_FACTOR;
    }
    if actual_timespan > target_timespan * RETARGETING_FACTOR {
        actual_timespan = target_timespan * RETARGETING_FACTOR;
    }

    let mut next = compact_to_u256(last.bits)?;
    next /= U256::from(target_timespan as u64);
    next = next.saturating_mul(U256::from(actual_timespan as u64));

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }

    Ok(u256_to_compact(next))
}

/// Median of the last eleven timestamps ending at `idx`, inclusive.
pub fn median_time_past(chain: &[HeaderInfo], idx: usize) -> i64 {
    let start = idx.saturating_sub(MEDIAN_TIME_SPAN - 1);
    let mut times: Vec<i64> = chain[start..=idx].iter().map(|header| header.time).collect();
    times.sort_unstable();
    times[times.len() / 2]
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeld_consensus::{chain_params, Network};

    fn window(params: &ConsensusParams, spacing: i64) -> Vec<HeaderInfo> {
        let interval = params.retarget_interval as i64;
        let bits = target_to_compact(&params.pow_limit);
        (0..interval)
            .map(|height| HeaderInfo {
                height,
                time: height * spacing,
                bits,
                version: 4,
            })
            .collect()
    }

    #[test]
    fn compact_roundtrip() {
        for bits in [0x1d00_ffffu32, 0x207f_ffff, 0x1b04_864c] {
            let value = compact_to_u256(bits).expect("decode compact");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn negative_compact_rejected() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
    }

    #[test]
    fn proof_grows_as_target_shrinks() {
        let easy = block_proof(0x207f_ffff).expect("easy proof");
        let hard = block_proof(0x1d00_ffff).expect("hard proof");
        assert!(hard > easy);
    }

    #[test]
    fn mid_period_keeps_bits() {
        let params = chain_params(Network::Mainnet).consensus;
        let bits = target_to_compact(&params.pow_limit);
        let chain = [HeaderInfo {
            height: 10,
            time: 6000,
            bits,
            version: 4,
        }];
        assert_eq!(get_next_work_required(&chain, &params).expect("bits"), bits);
    }

    #[test]
    fn fast_period_tightens_target() {
        let params = chain_params(Network::Mainnet).consensus;
        // Blocks at a tenth of the target spacing.
        let chain = window(&params, params.pow_target_spacing / 10);
        let next = get_next_work_required(&chain, &params).expect("bits");
        let old = compact_to_u256(chain.last().expect("non-empty").bits).expect("target");
        let new = compact_to_u256(next).expect("target");
        assert!(new < old);
    }

    #[test]
    fn slow_period_clamps_to_pow_limit() {
        let params = chain_params(Network::Mainnet).consensus;
        let chain = window(&params, params.pow_target_spacing * 100);
        let next = get_next_work_required(&chain, &params).expect("bits");
        assert_eq!(next, target_to_compact(&params.pow_limit));
    }

    #[test]
    fn regtest_never_retargets() {
        let params = chain_params(Network::Regtest).consensus;
        let chain = window(&params, 1);
        let bits = chain.last().expect("non-empty").bits;
        assert_eq!(get_next_work_required(&chain, &params).expect("bits"), bits);
    }

    #[test]
    fn median_time_past_is_middle_sample() {
        let times = [5, 1, 9, 3, 7, 2, 8, 4, 6, 0, 10];
        let chain: Vec<HeaderInfo> = times
            .iter()
            .enumerate()
            .map(|(height, time)| HeaderInfo {
                height: height as i64,
                time: *time,
                bits: 0,
                version: 4,
            })
            .collect();
        assert_eq!(median_time_past(&chain, chain.len() - 1), 5);
    }
}
