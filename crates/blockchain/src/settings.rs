//! Organizer configuration.

use std::num::NonZeroUsize;

#[derive(Clone, Debug)]
pub struct Settings {
    /// Maximum pool entries retained within the reorganization window.
    pub block_pool_capacity: usize,
    /// Maximum depth of an accepted reorganization; deeper pool entries are
    /// pruned.
    pub reorganization_limit: u32,
    /// Target priority-pool size; zero means one thread per core.
    pub cores: usize,
    /// Run validation threads at elevated priority.
    pub priority: bool,
    /// Offer transactions of displaced blocks back to the transaction pool.
    pub relay_transactions: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            block_pool_capacity: 5_000,
            reorganization_limit: 256,
            cores: 0,
            priority: true,
            relay_transactions: true,
        }
    }
}

impl Settings {
    /// Priority-pool size: `min(configured, core count)`, at least one.
    pub fn priority_threads(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        if self.cores == 0 {
            available
        } else {
            self.cores.min(available).max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_cores_uses_all_available() {
        let settings = Settings {
            cores: 0,
            ..Settings::default()
        };
        assert!(settings.priority_threads() >= 1);

        let single = Settings {
            cores: 1,
            ..Settings::default()
        };
        assert_eq!(single.priority_threads(), 1);
    }
}
