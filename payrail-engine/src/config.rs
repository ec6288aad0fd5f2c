//! Per-coin configuration.
//!
//! The engine does not read configuration files itself. These structs derive
//! serde so embedders can parse them from their own TOML or JSON sources;
//! validation happens once, at engine construction.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use payrail::{
    activity::NetworkType,
    amount::{AmountError, Denomination},
    fee::{fee_base_units, FeeRate},
    planner::PlannerConfig,
};

use crate::retry::RetryPolicy;

/// An invalid per-coin configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The target UTXO pool size must be at least 1.
    ZeroUtxoPoolSize,
    /// The minimum change setting is not a valid main-denomination value.
    MinChange(AmountError),
    /// The minimum transaction fee rate is not a valid fee rate.
    MinTxFee(String),
    /// The activity page size must be at least 1.
    ZeroPageSize,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ZeroUtxoPoolSize => {
                write!(f, "'target_utxo_pool_size' must be at least 1.")
            }
            Self::MinChange(e) => write!(f, "Invalid 'min_change': {}", e),
            Self::MinTxFee(e) => write!(f, "Invalid 'min_tx_fee': {}", e),
            Self::ZeroPageSize => write!(f, "'activity_page_size' must be at least 1."),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Settings shared by both chain families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinConfig {
    /// The native asset symbol, e.g. "BTC".
    pub asset_symbol: String,
    pub network_type: NetworkType,
    /// Conversion factor between main and base denominations.
    pub decimals: u8,
}

impl CoinConfig {
    pub fn denomination(&self) -> Denomination {
        Denomination::new(self.decimals)
    }
}

fn default_pool_size() -> u32 {
    1
}

fn default_min_change() -> String {
    "0".to_string()
}

/// Settings for a UTXO-based coin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtxoCoinConfig {
    #[serde(flatten)]
    pub coin: CoinConfig,
    /// Absolute fee lower bound, in base units.
    #[serde(default)]
    pub network_min_relay_fee: u64,
    /// Outputs at or below this value, in base units, are never emitted.
    #[serde(default)]
    pub dust_threshold: u64,
    /// How many UTXOs the wallet aims to keep around.
    #[serde(default = "default_pool_size")]
    pub target_utxo_pool_size: u32,
    /// Change outputs below this main-denomination value are dropped.
    #[serde(default = "default_min_change")]
    pub min_change: String,
    /// Whether unconfirmed outputs may be spent by default.
    #[serde(default)]
    pub use_unconfirmed_utxos: bool,
    /// Optional rate floor for computed fees. Kept last so the TOML form
    /// serializes its table after the scalar values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tx_fee: Option<FeeRate>,
}

impl UtxoCoinConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_utxo_pool_size == 0 {
            return Err(ConfigError::ZeroUtxoPoolSize);
        }
        self.min_change_base()?;
        if let Some(min_rate) = &self.min_tx_fee {
            fee_base_units(min_rate, 1, &self.coin.denomination())
                .map_err(|e| ConfigError::MinTxFee(e.to_string()))?;
        }
        Ok(())
    }

    /// The configured minimum change, in base units.
    pub fn min_change_base(&self) -> Result<u64, ConfigError> {
        self.coin
            .denomination()
            .main_to_base(&self.min_change)
            .map_err(ConfigError::MinChange)
    }

    /// The planner's view of this configuration.
    pub fn planner_config(&self) -> Result<PlannerConfig, ConfigError> {
        Ok(PlannerConfig {
            denomination: self.coin.denomination(),
            dust_threshold: self.dust_threshold,
            network_min_relay_fee: self.network_min_relay_fee,
            min_tx_fee: self.min_tx_fee.clone(),
            target_utxo_pool_size: self.target_utxo_pool_size,
            min_change_base: self.min_change_base()?,
        })
    }
}

fn default_page_size() -> u32 {
    10
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    200
}

fn default_reconnect_max_delay_ms() -> u64 {
    5_000
}

/// Settings for an account-based ledger coin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCoinConfig {
    #[serde(flatten)]
    pub coin: CoinConfig,
    /// How many payment transactions each history page requests.
    #[serde(default = "default_page_size")]
    pub activity_page_size: u32,
    /// How many reconnections to attempt on transport disconnection.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Backoff start, in milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Backoff cap, in milliseconds.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

impl LedgerCoinConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.activity_page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.reconnect_attempts,
            initial_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            factor: 2,
        }
    }
}
