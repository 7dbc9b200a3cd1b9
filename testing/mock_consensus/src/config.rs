use crate::Error;
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Difficulty of the hive genesis block plus a handful of mined blocks.
pub const DEFAULT_TERMINAL_TOTAL_DIFFICULTY: u64 = 131_072 + 25;
pub const DEFAULT_BLOCK_PRODUCTION_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TRANSITION_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Cumulative difficulty at which block production switches to the Engine API.
    pub terminal_total_difficulty: U256,
    pub block_production_interval: Duration,
    pub transition_check_interval: Duration,
    /// Bound applied to every individual call against a peer.
    pub rpc_timeout: Duration,
    /// Seeds the generator used for builder selection and `prev_randao` values.
    ///
    /// A random seed is drawn from the OS when unset.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            terminal_total_difficulty: U256::from(DEFAULT_TERMINAL_TOTAL_DIFFICULTY),
            block_production_interval: DEFAULT_BLOCK_PRODUCTION_INTERVAL,
            transition_check_interval: DEFAULT_TRANSITION_CHECK_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            seed: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.block_production_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "block_production_interval must be non-zero".to_string(),
            ));
        }
        if self.transition_check_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "transition_check_interval must be non-zero".to_string(),
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "rpc_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Timestamp increment between consecutive produced blocks, at least one second.
    pub fn timestamp_increment(&self) -> u64 {
        self.block_production_interval.as_secs().max(1)
    }
}
