//! Runtime half of the payrail payment engine.
//!
//! The engine drives the pure primitives of the `payrail` crate against
//! injected node facades, behind one payment contract shared by two chain
//! families: account-based ledgers with per-address sequences and server-side
//! history, and UTXO-based chains needing coin selection and change policy.
//!
//! The engine performs no networking of its own. Embedders inject a facade
//! implementing [`utxo::UtxoNode`] or [`ledger::LedgerNode`], and receive
//! back plans for their external signer, idempotent broadcast, balances, and
//! a uniform stream of [`BalanceActivity`] records.

pub mod config;
pub mod ledger;
pub mod retry;
#[cfg(test)]
mod testutils;
pub mod utxo;

pub use payrail;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};

use payrail::{
    amount::AmountError,
    fee::{FeeError, FeeOption},
    payport::{Payport, PayportError},
    planner::{PlannerError, UtxoInfo},
};

use crate::{
    config::ConfigError,
    ledger::{scanner::ScanError, LedgerError},
    utxo::NodeError,
};

/// A cloneable cancellation flag.
///
/// Every suspending engine operation takes one and checks it between facade
/// calls and sink invocations: once cancelled, no partial result is exposed
/// and no further sink invocation is made.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> CancelHandle {
        CancelHandle {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// A balance snapshot, in main-denomination strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: String,
    pub unconfirmed: String,
    /// What a regular (non-sweep) transaction may spend.
    pub spendable: String,
    /// Whether a sweep would clear the fee floor at all.
    pub sweepable: bool,
    /// Whether the address needs an activation deposit before it can
    /// transact (account-based chains with reserves).
    pub requires_activation: bool,
}

/// A transaction signed by the external signer, ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// The transaction id as computed at signing time.
    pub id: String,
    /// The raw signed bytes, lowercase hex.
    pub hex: String,
}

/// The outcome of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

/// What the engine knows about a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: String,
    pub status: TransactionStatus,
    pub confirmations: u64,
    pub block_height: Option<u64>,
    pub block_id: Option<String>,
    pub fee_main: Option<String>,
}

/// Per-call knobs for transaction creation.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub fee: FeeOption,
    /// Overrides the configured default when set.
    pub use_unconfirmed_utxos: Option<bool>,
    /// Plan against this UTXO set instead of querying the node.
    pub available_utxos: Option<Vec<UtxoInfo>>,
    /// Where change goes; defaults to the spending payport itself.
    pub change_address: Option<Payport>,
}

/// The payment contract every chain family implements.
///
/// All amounts crossing this interface are main-denomination decimal
/// strings; base-unit integers stay internal. Transaction ids and raw
/// transactions are lowercase hex strings.
pub trait PaymentsInterface {
    /// The unsigned plan handed to the external signer.
    type Tx;

    fn get_balance(&self, payport: &Payport) -> Result<Balance, EngineError>;

    fn create_transaction(
        &self,
        from: &Payport,
        to: &Payport,
        amount_main: &str,
        options: &TransactionOptions,
    ) -> Result<Self::Tx, EngineError>;

    fn create_multi_output_transaction(
        &self,
        from: &Payport,
        outputs: &[(Payport, String)],
        options: &TransactionOptions,
    ) -> Result<Self::Tx, EngineError>;

    /// Spend everything `from` holds, deducting the fee from the swept
    /// amount.
    fn create_sweep_transaction(
        &self,
        from: &Payport,
        to: &Payport,
        options: &TransactionOptions,
    ) -> Result<Self::Tx, EngineError>;

    fn broadcast_transaction(&self, signed: &SignedTransaction)
        -> Result<BroadcastResult, EngineError>;

    fn get_transaction_info(&self, txid: &str) -> Result<TransactionInfo, EngineError>;

    fn uses_utxos(&self) -> bool;
    fn uses_sequence_number(&self) -> bool;
    fn requires_balance_monitor(&self) -> bool;
}

/// Any error surfaced by the engine contract.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    Payport(PayportError),
    Amount(AmountError),
    Fee(FeeError),
    Planner(PlannerError),
    Config(ConfigError),
    Node(NodeError),
    Ledger(LedgerError),
    Scan(ScanError),
    /// The chain family does not support the requested operation.
    Unsupported(&'static str),
    Cancelled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Payport(e) => write!(f, "{}", e),
            Self::Amount(e) => write!(f, "{}", e),
            Self::Fee(e) => write!(f, "{}", e),
            Self::Planner(e) => write!(f, "{}", e),
            Self::Config(e) => write!(f, "{}", e),
            Self::Node(e) => write!(f, "{}", e),
            Self::Ledger(e) => write!(f, "{}", e),
            Self::Scan(e) => write!(f, "{}", e),
            Self::Unsupported(what) => write!(f, "Unsupported operation: {}.", what),
            Self::Cancelled => write!(f, "The operation was cancelled."),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<PayportError> for EngineError {
    fn from(e: PayportError) -> Self {
        Self::Payport(e)
    }
}

impl From<AmountError> for EngineError {
    fn from(e: AmountError) -> Self {
        Self::Amount(e)
    }
}

impl From<FeeError> for EngineError {
    fn from(e: FeeError) -> Self {
        Self::Fee(e)
    }
}

impl From<PlannerError> for EngineError {
    fn from(e: PlannerError) -> Self {
        Self::Planner(e)
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<NodeError> for EngineError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}

impl From<ScanError> for EngineError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::Cancelled => Self::Cancelled,
            other => Self::Scan(other),
        }
    }
}
