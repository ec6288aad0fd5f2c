//! The UTXO chain family.
//!
//! Wires the pure planner to an injected node facade and exposes the uniform
//! payment contract for Bitcoin-style chains: balance lookup, transaction
//! planning with coin selection and change policy, idempotent broadcast, and
//! transaction info lookup.

use std::fmt;

use serde::{Deserialize, Serialize};

use payrail::{
    amount::{AmountError, Denomination},
    capability::CoinCapabilities,
    fee::{resolve_fee_option, FeeOracle, FeeRate},
    payport::{resolve_payport, Payport, ResolvedPayport},
    planner::{plan_transaction, OutputIntent, PlannerConfig, PlannerError, UtxoInfo, UtxoPaymentPlan},
};

use crate::{
    config::UtxoCoinConfig, Balance, BroadcastResult, EngineError, PaymentsInterface,
    SignedTransaction, TransactionInfo, TransactionOptions, TransactionStatus,
};

/// Node facades prefix "already in mempool" rejections with this sentinel.
/// Broadcast treats them as success: the transaction is out there.
const MEMPOOL_DUPLICATE_PREFIX: &str = "-27";

/// An error from the UTXO node facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The node rejected or failed the request.
    Server(String),
    /// The transport to the node dropped.
    TransportDisconnected(String),
    /// The requested entity is unknown to the node.
    NotFound(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Server(e) => write!(f, "Node error: {}", e),
            Self::TransportDisconnected(e) => write!(f, "Node transport disconnected: {}", e),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
        }
    }
}

impl std::error::Error for NodeError {}

/// Balance information for an address, in base-unit strings as returned by
/// block explorer backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressDetails {
    pub balance: String,
    pub unconfirmed_balance: String,
}

/// What the node knows about a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDetail {
    pub txid: String,
    #[serde(default)]
    pub hex: Option<String>,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default)]
    pub block_id: Option<String>,
    pub confirmations: u64,
    #[serde(default)]
    pub fee_base: Option<u64>,
}

/// The injected UTXO node facade.
///
/// Implementations talk JSON-RPC or REST to a full node or block explorer;
/// the engine only relies on these four reads and writes. `send_tx` must
/// surface "already in mempool" rejections as a [`NodeError::Server`] whose
/// message starts with `-27`.
pub trait UtxoNode: Send {
    fn get_address_details(&self, address: &str) -> Result<AddressDetails, NodeError>;
    fn get_utxos(&self, address: &str) -> Result<Vec<UtxoInfo>, NodeError>;
    fn get_tx(&self, txid: &str) -> Result<TxDetail, NodeError>;
    /// Broadcast raw signed bytes, returning the transaction id.
    fn send_tx(&self, raw_hex: &str) -> Result<String, NodeError>;
}

/// The payment engine for a UTXO-based coin.
pub struct UtxoPayments<N: UtxoNode> {
    config: UtxoCoinConfig,
    planner_config: PlannerConfig,
    capabilities: CoinCapabilities,
    fee_oracle: Box<dyn FeeOracle + Send>,
    node: N,
}

impl<N: UtxoNode> UtxoPayments<N> {
    /// Create the engine, validating the configuration up front.
    pub fn new(
        config: UtxoCoinConfig,
        capabilities: CoinCapabilities,
        fee_oracle: Box<dyn FeeOracle + Send>,
        node: N,
    ) -> Result<UtxoPayments<N>, EngineError> {
        config.validate()?;
        let planner_config = config.planner_config()?;
        Ok(UtxoPayments {
            config,
            planner_config,
            capabilities,
            fee_oracle,
            node,
        })
    }

    pub fn config(&self) -> &UtxoCoinConfig {
        &self.config
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    fn denomination(&self) -> Denomination {
        self.config.coin.denomination()
    }

    fn resolve(&self, payport: &Payport) -> Result<ResolvedPayport, EngineError> {
        Ok(resolve_payport(payport, &self.capabilities)?)
    }

    fn resolve_rate(&self, options: &TransactionOptions) -> Result<FeeRate, EngineError> {
        Ok(resolve_fee_option(&options.fee, self.fee_oracle.as_ref())?.target_rate)
    }

    // The candidate set: an explicit override from the options, or whatever
    // the node reports for the address.
    fn candidate_utxos(
        &self,
        address: &str,
        options: &TransactionOptions,
    ) -> Result<Vec<UtxoInfo>, EngineError> {
        match &options.available_utxos {
            Some(utxos) => Ok(utxos.clone()),
            None => Ok(self.node.get_utxos(address)?),
        }
    }

    fn use_unconfirmed(&self, options: &TransactionOptions) -> bool {
        options
            .use_unconfirmed_utxos
            .unwrap_or(self.config.use_unconfirmed_utxos)
    }

    fn change_address(
        &self,
        from: &ResolvedPayport,
        options: &TransactionOptions,
    ) -> Result<String, EngineError> {
        match &options.change_address {
            Some(payport) => Ok(self.resolve(payport)?.address),
            None => Ok(from.address.clone()),
        }
    }

    fn parse_base_string(&self, value: &str) -> Result<u64, EngineError> {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| EngineError::Amount(AmountError::Malformed(value.to_string())))
    }
}

impl<N: UtxoNode> PaymentsInterface for UtxoPayments<N> {
    type Tx = UtxoPaymentPlan;

    fn get_balance(&self, payport: &Payport) -> Result<Balance, EngineError> {
        let resolved = self.resolve(payport)?;
        let details = self.node.get_address_details(&resolved.address)?;
        let confirmed = self.parse_base_string(&details.balance)?;
        let unconfirmed = self.parse_base_string(&details.unconfirmed_balance)?;
        let denom = self.denomination();
        // Anything below the dust and relay floors cannot be meaningfully
        // swept.
        let sweep_floor = self
            .config
            .dust_threshold
            .saturating_add(self.config.network_min_relay_fee);
        Ok(Balance {
            confirmed: denom.base_to_main(confirmed),
            unconfirmed: denom.base_to_main(unconfirmed),
            spendable: denom.base_to_main(confirmed),
            sweepable: confirmed > sweep_floor,
            requires_activation: false,
        })
    }

    fn create_transaction(
        &self,
        from: &Payport,
        to: &Payport,
        amount_main: &str,
        options: &TransactionOptions,
    ) -> Result<UtxoPaymentPlan, EngineError> {
        self.create_multi_output_transaction(
            from,
            &[(to.clone(), amount_main.to_string())],
            options,
        )
    }

    fn create_multi_output_transaction(
        &self,
        from: &Payport,
        outputs: &[(Payport, String)],
        options: &TransactionOptions,
    ) -> Result<UtxoPaymentPlan, EngineError> {
        let resolved_from = self.resolve(from)?;
        let rate = self.resolve_rate(options)?;
        let denom = self.denomination();
        let mut intents = Vec::with_capacity(outputs.len());
        for (payport, amount_main) in outputs {
            let resolved = self.resolve(payport)?;
            let value_base = denom.main_to_base(amount_main)?;
            intents.push(OutputIntent::new(resolved.address, value_base));
        }
        let utxos = self.candidate_utxos(&resolved_from.address, options)?;
        let change_address = self.change_address(&resolved_from, options)?;
        log::debug!(
            "Planning a transaction from {} over {} candidate UTXOs.",
            resolved_from.address,
            utxos.len()
        );
        Ok(plan_transaction(
            &self.planner_config,
            &self.capabilities,
            &utxos,
            &intents,
            &change_address,
            &rate,
            false,
            self.use_unconfirmed(options),
        )?)
    }

    fn create_sweep_transaction(
        &self,
        from: &Payport,
        to: &Payport,
        options: &TransactionOptions,
    ) -> Result<UtxoPaymentPlan, EngineError> {
        let resolved_from = self.resolve(from)?;
        let resolved_to = self.resolve(to)?;
        let rate = self.resolve_rate(options)?;
        let use_unconfirmed = self.use_unconfirmed(options);
        let utxos = self.candidate_utxos(&resolved_from.address, options)?;
        // The swept amount is the total of what will actually be spent; the
        // planner then deducts the fee from it.
        let swept: u64 = utxos
            .iter()
            .filter(|u| use_unconfirmed || u.is_confirmed())
            .map(|u| u.value_base)
            .sum();
        if swept == 0 {
            return Err(EngineError::Planner(PlannerError::InsufficientFunds {
                required: self.config.dust_threshold.saturating_add(1),
                available: 0,
            }));
        }
        let intents = [OutputIntent::new(resolved_to.address, swept)];
        let change_address = self.change_address(&resolved_from, options)?;
        Ok(plan_transaction(
            &self.planner_config,
            &self.capabilities,
            &utxos,
            &intents,
            &change_address,
            &rate,
            true,
            use_unconfirmed,
        )?)
    }

    fn broadcast_transaction(
        &self,
        signed: &SignedTransaction,
    ) -> Result<BroadcastResult, EngineError> {
        match self.node.send_tx(&signed.hex) {
            Ok(id) => Ok(BroadcastResult { id }),
            Err(NodeError::Server(message))
                if message.trim_start().starts_with(MEMPOOL_DUPLICATE_PREFIX) =>
            {
                log::debug!(
                    "Transaction {} is already in the mempool, treating as broadcast.",
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
        let tx = self.node.get_tx(txid)?;
        let denom = self.denomination();
        let status = if tx.confirmations > 0 {
            TransactionStatus::Confirmed
        } else {
            TransactionStatus::Pending
        };
        Ok(TransactionInfo {
            id: tx.txid,
            status,
            confirmations: tx.confirmations,
            block_height: tx.height,
            block_id: tx.block_id,
            fee_main: tx.fee_base.map(|fee| denom.base_to_main(fee)),
        })
    }

    fn uses_utxos(&self) -> bool {
        true
    }

    fn uses_sequence_number(&self) -> bool {
        false
    }

    fn requires_balance_monitor(&self) -> bool {
        false
    }
}
