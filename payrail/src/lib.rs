//! Core building blocks of the payrail payment engine.
//!
//! Everything in this crate is pure and deterministic: denomination
//! arithmetic, payport resolution, fee policies, balance activity modelling
//! and the UTXO transaction planner. I/O (node facades, broadcast, history
//! scanning) lives in the `payrail-engine` crate, which drives these
//! primitives.

pub mod activity;
pub mod amount;
pub mod capability;
pub mod fee;
pub mod payport;
pub mod planner;

pub use activity::{activity_sequence, ActivityDirection, BalanceActivity, NetworkType};
pub use amount::{AmountError, Denomination};
pub use capability::{CapabilityError, CoinCapabilities, SerializedTx};
pub use fee::{FeeError, FeeLevel, FeeOption, FeeOracle, FeeRate, FeeRateType, ResolvedFeeOption};
pub use payport::{resolve_payport, Payport, PayportError, ResolvedPayport};
pub use planner::{
    plan_transaction, OutputIntent, PlannedOutput, PlannerConfig, PlannerError, UtxoInfo,
    UtxoPaymentPlan,
};
