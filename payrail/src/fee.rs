//! Fee policies.
//!
//! A caller expresses its fee requirements either as a named level, resolved
//! through the coin's fee oracle, or as an explicit rate. Rates carry a unit
//! tag telling the planner how to derive base-unit fees from a transaction
//! shape.

use std::fmt;

use bigdecimal::{num_bigint::Sign, BigDecimal};
use serde::{Deserialize, Serialize};

use crate::amount::{AmountError, Denomination};

/// A named fee urgency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeLevel {
    Slow,
    Normal,
    Fast,
}

impl fmt::Display for FeeLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Slow => write!(f, "slow"),
            Self::Normal => write!(f, "normal"),
            Self::Fast => write!(f, "fast"),
        }
    }
}

/// How a fee rate value is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeRateType {
    /// Base units per weight unit (vbyte); multiplied by the estimated size.
    BasePerWeight,
    /// A flat fee in base units.
    Base,
    /// A flat fee in the main denomination.
    Main,
}

/// A fee rate with its unit tag. The rate is a decimal string so that
/// sub-base-unit per-weight rates are expressible without floating point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRate {
    pub rate: String,
    pub rate_type: FeeRateType,
}

impl FeeRate {
    pub fn new<R: Into<String>>(rate: R, rate_type: FeeRateType) -> FeeRate {
        FeeRate {
            rate: rate.into(),
            rate_type,
        }
    }

    /// Shorthand for the common base-per-weight case.
    pub fn per_weight<R: Into<String>>(rate: R) -> FeeRate {
        FeeRate::new(rate, FeeRateType::BasePerWeight)
    }
}

/// The caller-facing fee requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeOption {
    Level(FeeLevel),
    Rate(FeeRate),
}

impl Default for FeeOption {
    fn default() -> Self {
        FeeOption::Level(FeeLevel::Normal)
    }
}

/// The outcome of fee-option resolution: the level it was resolved from, if
/// any, and the concrete rate to plan with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFeeOption {
    pub target_level: Option<FeeLevel>,
    pub target_rate: FeeRate,
}

/// An error in fee resolution or derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeeError {
    /// The rate string is not a non-negative decimal.
    InvalidRate(String),
    /// The coin's fee oracle could not provide an estimate.
    Oracle(String),
    Amount(AmountError),
}

impl fmt::Display for FeeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidRate(r) => write!(f, "Invalid fee rate '{}'.", r),
            Self::Oracle(e) => write!(f, "Fee oracle error: {}", e),
            Self::Amount(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FeeError {}

impl From<AmountError> for FeeError {
    fn from(e: AmountError) -> Self {
        Self::Amount(e)
    }
}

/// The coin-specific fee estimation seam. Implementations typically query
/// the node facade; the engine passes their answer through unchanged.
pub trait FeeOracle {
    fn estimate(&self, level: FeeLevel) -> Result<FeeRate, FeeError>;
}

/// Resolve a fee option into a concrete rate, consulting the oracle when a
/// level was supplied.
pub fn resolve_fee_option(
    option: &FeeOption,
    oracle: &dyn FeeOracle,
) -> Result<ResolvedFeeOption, FeeError> {
    match option {
        FeeOption::Level(level) => {
            let rate = oracle.estimate(*level)?;
            log::debug!("Fee level {} resolved to {:?}.", level, rate);
            Ok(ResolvedFeeOption {
                target_level: Some(*level),
                target_rate: rate,
            })
        }
        FeeOption::Rate(rate) => {
            parse_rate(rate)?;
            Ok(ResolvedFeeOption {
                target_level: None,
                target_rate: rate.clone(),
            })
        }
    }
}

fn parse_rate(rate: &FeeRate) -> Result<BigDecimal, FeeError> {
    let parsed: BigDecimal = rate
        .rate
        .trim()
        .parse()
        .map_err(|_| FeeError::InvalidRate(rate.rate.clone()))?;
    if parsed.sign() == Sign::Minus {
        return Err(FeeError::InvalidRate(rate.rate.clone()));
    }
    Ok(parsed)
}

/// Derive the base-unit fee implied by a rate for a transaction of
/// `size_vbytes` virtual bytes, rounded up to a whole base unit.
pub fn fee_base_units(
    rate: &FeeRate,
    size_vbytes: u64,
    denomination: &Denomination,
) -> Result<u64, FeeError> {
    let parsed = parse_rate(rate)?;
    let fee = match rate.rate_type {
        FeeRateType::BasePerWeight => parsed * BigDecimal::from(size_vbytes),
        FeeRateType::Main => denomination.main_to_base_decimal(&parsed),
        FeeRateType::Base => parsed,
    };
    Ok(denomination.ceil_base_units(&fee)?)
}
