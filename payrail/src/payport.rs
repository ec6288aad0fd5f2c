//! Payport resolution.
//!
//! A payport is a destination handle: an account index of the wallet's own
//! key chain, a raw address, or an address together with an extra id
//! (destination tag / memo) on chains that need one. Resolution turns any of
//! the three into a validated `{address, extra_id}` pair.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityError, CoinCapabilities};

/// A destination handle, in one of its three forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payport {
    /// An account index, resolved through the coin's address deriver.
    Index(u32),
    /// A raw address.
    Address(String),
    /// An address with an optional extra id.
    Full {
        address: String,
        #[serde(default)]
        extra_id: Option<String>,
    },
}

impl Payport {
    pub fn from_index(index: u32) -> Payport {
        Payport::Index(index)
    }

    pub fn from_address<A: Into<String>>(address: A) -> Payport {
        Payport::Address(address.into())
    }

    pub fn with_extra_id<A: Into<String>, E: Into<String>>(address: A, extra_id: E) -> Payport {
        Payport::Full {
            address: address.into(),
            extra_id: Some(extra_id.into()),
        }
    }
}

impl fmt::Display for Payport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payport::Index(i) => write!(f, "account #{}", i),
            Payport::Address(a) => write!(f, "{}", a),
            Payport::Full { address, extra_id } => match extra_id {
                Some(id) => write!(f, "{}?extra_id={}", address, id),
                None => write!(f, "{}", address),
            },
        }
    }
}

/// A validated destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPayport {
    pub address: String,
    pub extra_id: Option<String>,
}

/// An error resolving a payport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayportError {
    /// The address does not pass the coin's validation.
    InvalidAddress(String),
    /// The deriver could not produce an address for this account index.
    Derivation(CapabilityError),
}

impl fmt::Display for PayportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidAddress(a) => write!(f, "Invalid address '{}'.", a),
            Self::Derivation(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PayportError {}

/// Resolve a payport into a validated `{address, extra_id}`.
///
/// Pure apart from the injected address deriver.
pub fn resolve_payport(
    payport: &Payport,
    capabilities: &CoinCapabilities,
) -> Result<ResolvedPayport, PayportError> {
    let (address, extra_id) = match payport {
        Payport::Index(index) => {
            let address =
                (capabilities.derive_address)(*index).map_err(PayportError::Derivation)?;
            (address, None)
        }
        Payport::Address(address) => (address.clone(), None),
        Payport::Full { address, extra_id } => (address.clone(), extra_id.clone()),
    };
    if !(capabilities.validate_address)(&address) {
        return Err(PayportError::InvalidAddress(address));
    }
    Ok(ResolvedPayport { address, extra_id })
}
