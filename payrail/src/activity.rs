//! The balance activity model.
//!
//! Both the historical scanner and the live subscription bridge emit the
//! same record: one entry per movement of the native asset on an address,
//! totally ordered by a lexicographic activity sequence.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether an activity moved funds into or out of the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityDirection {
    In,
    Out,
}

impl ActivityDirection {
    /// The tertiary component of the activity sequence. Outbound sorts
    /// before inbound at the same (ledger, index) slot, which is the
    /// canonical ordering for accounting.
    fn tertiary(self) -> &'static str {
        match self {
            Self::Out => "00",
            Self::In => "01",
        }
    }
}

impl fmt::Display for ActivityDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::In => write!(f, "in"),
            Self::Out => write!(f, "out"),
        }
    }
}

/// Which deployment of a chain an activity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Devnet,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
            Self::Devnet => write!(f, "devnet"),
        }
    }
}

/// One movement of the native asset on an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceActivity {
    pub direction: ActivityDirection,
    pub network_type: NetworkType,
    pub asset_symbol: String,
    pub address: String,
    pub extra_id: Option<String>,
    /// Signed main-denomination amount: negative for outbound movements.
    pub amount_main: String,
    /// The transaction id this activity stems from.
    pub external_id: String,
    /// Lexicographically sortable total order key, see [`activity_sequence`].
    pub activity_sequence: String,
    /// The hash of the ledger (block) the transaction was recorded in.
    pub confirmation_id: String,
    /// The height of that ledger.
    pub confirmation_number: u64,
    pub timestamp_secs: i64,
}

/// Build the total-order key for an activity.
///
/// The key is `zero_pad(ledger, 12) + "." + zero_pad(index, 8) + "." +
/// tertiary`, with the tertiary putting outbound before inbound at the same
/// slot. Plain string comparison of two keys therefore orders activities by
/// ledger, then by position within the ledger, then by direction,
/// independently of wall-clock time.
pub fn activity_sequence(
    ledger_version: u64,
    index_in_ledger: u32,
    direction: ActivityDirection,
) -> String {
    format!(
        "{:012}.{:08}.{}",
        ledger_version,
        index_in_ledger,
        direction.tertiary()
    )
}
