//! The account-based ledger chain family.
//!
//! Ripple-style ledgers keep balances per address with a sequence number per
//! account, retain a bounded window of history on the server, and push live
//! transaction events over a long-lived connection. This module exposes the
//! uniform payment contract on top of an injected ledger node facade, plus
//! the balance activity scanner and the live subscription bridge.

pub mod monitor;
pub mod scanner;

use std::{collections::HashMap, fmt, sync::mpsc, sync::Mutex};

use serde::{Deserialize, Serialize};

use payrail::{
    activity::NetworkType,
    amount::Denomination,
    capability::CoinCapabilities,
    fee::{fee_base_units, resolve_fee_option, FeeOracle, FeeRateType},
    payport::{resolve_payport, Payport, ResolvedPayport},
    planner::PlannerError,
};

use crate::{
    config::LedgerCoinConfig,
    retry::{with_reconnect, RetryPolicy},
    Balance, BroadcastResult, CancelHandle, EngineError, PaymentsInterface, SignedTransaction,
    TransactionInfo, TransactionOptions, TransactionStatus,
};

use monitor::BalanceMonitor;
use scanner::{scan_activities, ActivityScanOptions, ScanOutcome};

/// Submission rejections carrying this prefix mean the transaction already
/// made it into the open ledger; broadcast treats them as success.
const ALREADY_SUBMITTED_PREFIX: &str = "tefALREADY";

/// An error from the ledger node facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The server rejected or failed the request.
    Server(String),
    /// The transport to the server dropped.
    TransportDisconnected(String),
    /// An operation that needs an established connection was attempted
    /// without one.
    NotConnected,
    /// The server's retained ledger range could not be understood.
    InvalidLedgerRange(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Server(e) => write!(f, "Ledger server error: {}", e),
            Self::TransportDisconnected(e) => {
                write!(f, "Ledger transport disconnected: {}", e)
            }
            Self::NotConnected => write!(f, "Not connected to the ledger server."),
            Self::InvalidLedgerRange(r) => {
                write!(f, "Cannot parse the server's ledger range '{}'.", r)
            }
        }
    }
}

impl std::error::Error for LedgerError {}

/// One side of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEndpoint {
    pub address: String,
    /// The destination tag / memo, where the chain has one.
    #[serde(default)]
    pub tag: Option<String>,
}

/// A per-asset signed balance movement, in the main denomination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetChange {
    pub symbol: String,
    pub amount_main: String,
}

/// A transaction as reported by the ledger server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTx {
    pub id: String,
    /// The server-side type tag; only payments are classified.
    pub tx_type: String,
    pub successful: bool,
    pub source: LedgerEndpoint,
    pub destination: LedgerEndpoint,
    pub ledger_version: u64,
    /// Position of the transaction within its ledger.
    pub index_in_ledger: u32,
    /// Net balance movements per address, one entry per asset.
    pub balance_changes: HashMap<String, Vec<AssetChange>>,
    pub timestamp_secs: i64,
}

/// A ledger (block) header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub ledger_version: u64,
    pub ledger_hash: String,
    pub close_time_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// The retained history window, as "min-max".
    pub complete_ledgers: String,
}

/// Account state, as far as the engine needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Whether the account exists on ledger (has received its activation
    /// deposit).
    pub activated: bool,
    pub balance_main: String,
    /// The sequence number the next transaction must carry.
    pub sequence: u64,
}

/// Query options for a history page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxQueryOptions {
    pub earliest_first: bool,
    pub exclude_failures: bool,
    pub limit: u32,
    pub min_ledger_version: Option<u64>,
    pub max_ledger_version: Option<u64>,
    /// Resume after this transaction instead of using the ledger bounds.
    pub start_tx_id: Option<String>,
}

/// The injected ledger node facade.
///
/// Implementations wrap a websocket or JSON-RPC client; the engine assumes
/// every read is idempotent and retries it through the configured
/// reconnection policy on transport disconnection.
pub trait LedgerNode: Send {
    fn is_connected(&self) -> bool;
    fn connect(&mut self) -> Result<(), LedgerError>;
    fn disconnect(&mut self) -> Result<(), LedgerError>;
    /// Escape hatch for server methods the typed surface does not cover.
    fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, LedgerError>;
    fn get_server_info(&self) -> Result<ServerInfo, LedgerError>;
    fn get_account_info(&self, address: &str) -> Result<AccountInfo, LedgerError>;
    fn get_transactions(
        &self,
        address: &str,
        options: &TxQueryOptions,
    ) -> Result<Vec<LedgerTx>, LedgerError>;
    fn get_ledger(&self, ledger_version: u64) -> Result<LedgerHeader, LedgerError>;
    /// Ask the server to push transaction events for these addresses.
    fn subscribe(&mut self, addresses: &[String]) -> Result<(), LedgerError>;
    /// Hand over the push event stream. Yields `None` once taken.
    fn take_events(&mut self) -> Option<mpsc::Receiver<LedgerTx>>;
}

/// The unsigned payment handed to the external signer, account-chain style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPaymentPlan {
    pub from_address: String,
    pub to_address: String,
    pub extra_id: Option<String>,
    pub amount_main: String,
    pub fee_main: String,
    /// The account sequence this transaction must be signed with.
    pub sequence: u64,
    pub network_type: NetworkType,
    pub asset_symbol: String,
}

/// The payment engine for an account-based ledger coin.
pub struct LedgerPayments<L: LedgerNode> {
    config: LedgerCoinConfig,
    capabilities: CoinCapabilities,
    fee_oracle: Box<dyn FeeOracle + Send>,
    retry: RetryPolicy,
    node: Mutex<L>,
}

impl<L: LedgerNode> LedgerPayments<L> {
    /// Create the engine, validating the configuration up front.
    pub fn new(
        config: LedgerCoinConfig,
        capabilities: CoinCapabilities,
        fee_oracle: Box<dyn FeeOracle + Send>,
        node: L,
    ) -> Result<LedgerPayments<L>, EngineError> {
        config.validate()?;
        let retry = config.retry_policy();
        Ok(LedgerPayments {
            config,
            capabilities,
            fee_oracle,
            retry,
            node: Mutex::new(node),
        })
    }

    pub fn config(&self) -> &LedgerCoinConfig {
        &self.config
    }

    // Useful for unit tests to inspect the injected facade.
    #[cfg(test)]
    pub(crate) fn node(&self) -> &Mutex<L> {
        &self.node
    }

    fn denomination(&self) -> Denomination {
        self.config.coin.denomination()
    }

    fn resolve(&self, payport: &Payport) -> Result<ResolvedPayport, EngineError> {
        Ok(resolve_payport(payport, &self.capabilities)?)
    }

    fn account_info(&self, address: &str) -> Result<AccountInfo, EngineError> {
        Ok(with_reconnect(&self.retry, &self.node, |node| {
            node.get_account_info(address)
        })?)
    }

    // The flat fee for one transaction, in the main denomination.
    fn resolve_fee_main(&self, options: &TransactionOptions) -> Result<String, EngineError> {
        let rate = resolve_fee_option(&options.fee, self.fee_oracle.as_ref())?.target_rate;
        let denom = self.denomination();
        let fee_main = match rate.rate_type {
            FeeRateType::Main => denom.parse_main(&rate.rate)?.normalized().to_string(),
            // Account ledgers have no size dimension; a per-weight rate is a
            // flat base-unit fee here.
            FeeRateType::Base | FeeRateType::BasePerWeight => {
                denom.base_to_main(fee_base_units(&rate, 1, &denom)?)
            }
        };
        Ok(fee_main)
    }

    /// Replay the historical balance activities of `payport` into `sink`,
    /// earliest first. Returns the ledger window actually scanned, which may
    /// be narrower than requested if the server retains less history.
    pub fn retrieve_balance_activities(
        &self,
        payport: &Payport,
        sink: &mut scanner::ActivitySink<'_>,
        options: &ActivityScanOptions,
        cancel: &CancelHandle,
    ) -> Result<ScanOutcome, EngineError> {
        let resolved = self.resolve(payport)?;
        Ok(scan_activities(
            &self.node,
            &self.retry,
            &self.config,
            &resolved.address,
            sink,
            options,
            cancel,
        )?)
    }

    /// Subscribe to live payment events for a set of payports and return a
    /// drainable monitor over the resulting balance activities.
    ///
    /// Subscription is best-effort: a server rejection is logged and the
    /// monitor still drains whatever the connection delivers.
    pub fn balance_monitor(
        &self,
        payports: &[Payport],
        cancel: CancelHandle,
    ) -> Result<BalanceMonitor<'_, L>, EngineError> {
        let mut addresses = Vec::with_capacity(payports.len());
        for payport in payports {
            addresses.push(self.resolve(payport)?.address);
        }
        let events = {
            let mut node = self.node.lock().expect("ledger node mutex must not be poisoned");
            if let Err(e) = node.subscribe(&addresses) {
                log::warn!("Server rejected the subscription: {}", e);
            }
            node.take_events()
                .ok_or(EngineError::Unsupported("event stream already taken"))?
        };
        Ok(BalanceMonitor::new(
            &self.node,
            &self.retry,
            &self.config,
            addresses,
            events,
            cancel,
        ))
    }
}

impl<L: LedgerNode> PaymentsInterface for LedgerPayments<L> {
    type Tx = LedgerPaymentPlan;

    fn get_balance(&self, payport: &Payport) -> Result<Balance, EngineError> {
        let resolved = self.resolve(payport)?;
        let info = self.account_info(&resolved.address)?;
        let denom = self.denomination();
        let balance_base = denom.main_to_base(&info.balance_main)?;
        Ok(Balance {
            confirmed: denom.base_to_main(balance_base),
            unconfirmed: "0".to_string(),
            spendable: denom.base_to_main(balance_base),
            sweepable: info.activated && balance_base > 0,
            requires_activation: !info.activated,
        })
    }

    fn create_transaction(
        &self,
        from: &Payport,
        to: &Payport,
        amount_main: &str,
        options: &TransactionOptions,
    ) -> Result<LedgerPaymentPlan, EngineError> {
        let resolved_from = self.resolve(from)?;
        let resolved_to = self.resolve(to)?;
        let denom = self.denomination();
        let amount_base = denom.main_to_base(amount_main)?;
        if amount_base == 0 {
            return Err(EngineError::Planner(PlannerError::InvalidAmount(
                "the amount must be positive".to_string(),
            )));
        }
        let fee_main = self.resolve_fee_main(options)?;
        let info = self.account_info(&resolved_from.address)?;
        Ok(LedgerPaymentPlan {
            from_address: resolved_from.address,
            to_address: resolved_to.address,
            extra_id: resolved_to.extra_id,
            amount_main: denom.base_to_main(amount_base),
            fee_main,
            sequence: info.sequence,
            network_type: self.config.coin.network_type,
            asset_symbol: self.config.coin.asset_symbol.clone(),
        })
    }

    fn create_multi_output_transaction(
        &self,
        from: &Payport,
        outputs: &[(Payport, String)],
        options: &TransactionOptions,
    ) -> Result<LedgerPaymentPlan, EngineError> {
        match outputs {
            [(to, amount_main)] => self.create_transaction(from, to, amount_main, options),
            _ => Err(EngineError::Unsupported(
                "account-based ledgers pay a single destination per transaction",
            )),
        }
    }

    fn create_sweep_transaction(
        &self,
        from: &Payport,
        to: &Payport,
        options: &TransactionOptions,
    ) -> Result<LedgerPaymentPlan, EngineError> {
        let resolved_from = self.resolve(from)?;
        let denom = self.denomination();
        let info = self.account_info(&resolved_from.address)?;
        let balance_base = denom.main_to_base(&info.balance_main)?;
        let fee_main = self.resolve_fee_main(options)?;
        let fee_base = denom.main_to_base(&fee_main)?;
        let swept = balance_base.checked_sub(fee_base).filter(|v| *v > 0).ok_or(
            EngineError::Planner(PlannerError::InsufficientFunds {
                required: fee_base,
                available: balance_base,
            }),
        )?;
        self.create_transaction(from, to, &denom.base_to_main(swept), options)
    }

    fn broadcast_transaction(
        &self,
        signed: &SignedTransaction,
    ) -> Result<BroadcastResult, EngineError> {
        let params = serde_json::json!({ "tx_blob": signed.hex });
        let result = {
            let node = self.node.lock().expect("ledger node mutex must not be poisoned");
            node.request("submit", params)
        };
        match result {
            Ok(value) => {
                let id = value
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&signed.id)
                    .to_string();
                Ok(BroadcastResult { id })
            }
            Err(LedgerError::Server(message))
                if message.trim_start().starts_with(ALREADY_SUBMITTED_PREFIX) =>
            {
                log::debug!(
                    "Transaction {} was already submitted, treating as broadcast.",
                    signed.id
                );
                Ok(BroadcastResult {
                    id: signed.id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_transaction_info(&self, txid: &str) -> Result<TransactionInfo, EngineError> {
        let params = serde_json::json!({ "transaction": txid });
        let value = with_reconnect(&self.retry, &self.node, |node| {
            node.request("tx", params.clone())
        })?;
        let validated = value
            .get("validated")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let ledger_index = value.get("ledger_index").and_then(|v| v.as_u64());
        let confirmations = if validated {
            let info = with_reconnect(&self.retry, &self.node, |node| node.get_server_info())?;
            let (_, newest) = scanner::parse_ledger_range(&info.complete_ledgers)
                .map_err(|e| EngineError::Ledger(e))?;
            ledger_index
                .map(|height| newest.saturating_sub(height).saturating_add(1))
                .unwrap_or(1)
        } else {
            0
        };
        Ok(TransactionInfo {
            id: txid.to_string(),
            status: if validated {
                TransactionStatus::Confirmed
            } else {
                TransactionStatus::Pending
            },
            confirmations,
            block_height: ledger_index,
            block_id: value
                .get("ledger_hash")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            fee_main: value
                .get("fee")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
    }

    fn uses_utxos(&self) -> bool {
        false
    }

    fn uses_sequence_number(&self) -> bool {
        true
    }

    fn requires_balance_monitor(&self) -> bool {
        true
    }
}
