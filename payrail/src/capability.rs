//! The per-coin capability record.
//!
//! Coin-specific behavior is injected as a record of functions rather than
//! through a class hierarchy: address validation and derivation, transaction
//! size estimation, and plan serialization. The planner and payport resolver
//! take the record as a parameter.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::planner::PlanOutline;

/// An error from an injected capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// Address derivation for an account index failed.
    Derivation(String),
    /// The plan could not be serialized.
    Serialization(String),
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Derivation(e) => write!(f, "Address derivation error: {}", e),
            Self::Serialization(e) => write!(f, "Plan serialization error: {}", e),
        }
    }
}

impl std::error::Error for CapabilityError {}

/// The two serialized forms of a planned transaction: the raw hex and its
/// hash. Produced by the injected serializer, handed to the external signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedTx {
    pub hex: String,
    pub hash: String,
}

pub type ValidateAddressFn = Box<dyn Fn(&str) -> bool + Send + Sync>;
pub type DeriveAddressFn = Box<dyn Fn(u32) -> Result<String, CapabilityError> + Send + Sync>;
/// `(input_count, change_output_count, external_addresses) -> size in vbytes`.
pub type EstimateSizeFn = Box<dyn Fn(usize, usize, &[String]) -> u64 + Send + Sync>;
pub type SerializePlanFn =
    Box<dyn Fn(&PlanOutline) -> Result<SerializedTx, CapabilityError> + Send + Sync>;

/// Byte cost of a transaction skeleton, per input and per output, for the
/// default size estimator.
const TX_BASE_VBYTES: u64 = 10;
const TX_INPUT_VBYTES: u64 = 148;
const TX_OUTPUT_VBYTES: u64 = 34;

/// The capability record a coin implementation provides to the engine.
///
/// `estimate_size` defaults to the legacy P2PKH shape; segwit or multisig
/// coins override it through [`CoinCapabilities::with_size_estimator`].
pub struct CoinCapabilities {
    pub validate_address: ValidateAddressFn,
    pub derive_address: DeriveAddressFn,
    pub estimate_size: EstimateSizeFn,
    pub serialize_plan: SerializePlanFn,
}

impl CoinCapabilities {
    pub fn new(
        validate_address: ValidateAddressFn,
        derive_address: DeriveAddressFn,
        serialize_plan: SerializePlanFn,
    ) -> CoinCapabilities {
        CoinCapabilities {
            validate_address,
            derive_address,
            estimate_size: Box::new(default_estimate_size),
            serialize_plan,
        }
    }

    pub fn with_size_estimator(mut self, estimate_size: EstimateSizeFn) -> CoinCapabilities {
        self.estimate_size = estimate_size;
        self
    }
}

impl fmt::Debug for CoinCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // The record holds opaque functions, there is nothing more to show.
        write!(f, "CoinCapabilities")
    }
}

/// The default transaction size estimation, in virtual bytes.
pub fn default_estimate_size(
    input_count: usize,
    change_output_count: usize,
    external_addresses: &[String],
) -> u64 {
    TX_BASE_VBYTES
        + TX_INPUT_VBYTES * input_count as u64
        + TX_OUTPUT_VBYTES * (change_output_count + external_addresses.len()) as u64
}
