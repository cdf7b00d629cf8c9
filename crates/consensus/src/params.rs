//! Per-network chain parameters.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    /// Easiest permitted target, little-endian.
    pub pow_limit: Hash256,
    /// Desired seconds between blocks.
    pub pow_target_spacing: i64,
    /// Blocks per difficulty adjustment period.
    pub retarget_interval: u32,
    /// Desired seconds per difficulty adjustment period.
    pub retarget_timespan: i64,
    /// Difficulty never adjusts (regtest).
    pub no_retarget: bool,
    /// Height at which the coinbase must commit the block height.
    pub bip34_height: u32,
    /// Height at which checklocktimeverify activates.
    pub bip65_height: u32,
    /// Height at which strict DER signatures activate.
    pub bip66_height: u32,
    /// Number of recent headers sampled for version enforcement.
    pub version_sample_window: u32,
    /// Samples at or above a version required before older versions are rejected.
    pub version_enforce_threshold: u32,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
}

fn mainnet_pow_limit() -> Hash256 {
    // 0xffff * 2^208
    let mut limit = [0u8; 32];
    limit[26] = 0xff;
    limit[27] = 0xff;
    limit
}

fn regtest_pow_limit() -> Hash256 {
    // 0x7fffff * 2^232
    let mut limit = [0u8; 32];
    limit[29] = 0xff;
    limit[30] = 0xff;
    limit[31] = 0x7f;
    limit
}

pub fn chain_params(network: Network) -> ChainParams {
    let consensus = match network {
        Network::Mainnet => ConsensusParams {
            pow_limit: mainnet_pow_limit(),
            pow_target_spacing: 600,
            retarget_interval: 2016,
            retarget_timespan: 14 * 24 * 60 * 60,
            no_retarget: false,
            bip34_height: 227_931,
            bip65_height: 388_381,
            bip66_height: 363_725,
            version_sample_window: 1000,
            version_enforce_threshold: 950,
        },
        Network::Testnet => ConsensusParams {
            pow_limit: mainnet_pow_limit(),
            pow_target_spacing: 600,
            retarget_interval: 2016,
            retarget_timespan: 14 * 24 * 60 * 60,
            no_retarget: false,
            bip34_height: 21_111,
            bip65_height: 581_885,
            bip66_height: 330_776,
            version_sample_window: 100,
            version_enforce_threshold: 75,
        },
        Network::Regtest => ConsensusParams {
            pow_limit: regtest_pow_limit(),
            pow_target_spacing: 600,
            retarget_interval: 2016,
            retarget_timespan: 14 * 24 * 60 * 60,
            no_retarget: true,
            bip34_height: 0,
            bip65_height: 0,
            bip66_height: 0,
            version_sample_window: 100,
            version_enforce_threshold: 75,
        },
    };
    ChainParams { network, consensus }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow_limits_are_nonzero() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = chain_params(network);
            assert!(params.consensus.pow_limit.iter().any(|byte| *byte != 0));
        }
    }

    #[test]
    fn regtest_skips_retarget() {
        assert!(chain_params(Network::Regtest).consensus.no_retarget);
        assert!(!chain_params(Network::Mainnet).consensus.no_retarget);
    }
}
