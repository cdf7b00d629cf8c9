//! Block subsidy schedule.

use crate::constants::SUBSIDY_HALVING_INTERVAL;
use crate::money::COIN;
use crate::params::ConsensusParams;

/// The subsidy a coinbase may claim at `height`, before fees.
pub fn block_subsidy(height: u32, _params: &ConsensusParams) -> i64 {
    let halvings = height / SUBSIDY_HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{chain_params, Network};

    #[test]
    fn subsidy_halves_on_schedule() {
        let params = chain_params(Network::Mainnet).consensus;
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(SUBSIDY_HALVING_INTERVAL - 1, &params), 50 * COIN);
        assert_eq!(block_subsidy(SUBSIDY_HALVING_INTERVAL, &params), 25 * COIN);
        assert_eq!(block_subsidy(64 * SUBSIDY_HALVING_INTERVAL, &params), 0);
    }
}
