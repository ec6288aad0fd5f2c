//! UTXO selection and transaction planning.
//!
//! This is the deterministic heart of the UTXO family: given spendable
//! outputs, desired payments, a fee rate and the pool-maintenance policy, it
//! produces a concrete plan with an exact input set, output amounts, fee and
//! change distribution. No randomness and no clock: the same request always
//! yields a byte-identical plan.

use std::{cmp, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    amount::{checked_sum, AmountError, Denomination},
    capability::{CapabilityError, CoinCapabilities, SerializedTx},
    fee::{fee_base_units, FeeError, FeeRate},
};

/// A spendable transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoInfo {
    pub txid: String,
    pub vout: u32,
    /// The value in base units.
    pub value_base: u64,
    /// The same value in the main denomination, carried for convenience.
    pub value_main: String,
    /// The height of the block this output was confirmed in, if any.
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default)]
    pub lock_time: Option<u64>,
    /// The script or address this output is bound to.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl UtxoInfo {
    /// Build a UTXO record from its base-unit value.
    pub fn from_base<T: Into<String>>(
        txid: T,
        vout: u32,
        value_base: u64,
        denomination: &Denomination,
    ) -> UtxoInfo {
        UtxoInfo {
            txid: txid.into(),
            vout,
            value_base,
            value_main: denomination.base_to_main(value_base),
            height: None,
            lock_time: None,
            script: None,
            address: None,
        }
    }

    pub fn confirmed_at(mut self, height: u64) -> UtxoInfo {
        self.height = Some(height);
        self
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.height, Some(h) if h > 0)
    }
}

impl fmt::Display for UtxoInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A desired external payment, already resolved and validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputIntent {
    pub address: String,
    pub value_base: u64,
}

impl OutputIntent {
    pub fn new<A: Into<String>>(address: A, value_base: u64) -> OutputIntent {
        OutputIntent {
            address: address.into(),
            value_base,
        }
    }
}

/// An output of a planned transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOutput {
    pub address: String,
    pub value_base: u64,
    pub value_main: String,
}

/// The planner's view of the per-coin configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub denomination: Denomination,
    /// Outputs at or below this value are never emitted.
    pub dust_threshold: u64,
    /// Absolute lower bound on the fee, in base units.
    pub network_min_relay_fee: u64,
    /// Optional rate floor for computed fees.
    pub min_tx_fee: Option<FeeRate>,
    /// How many UTXOs the wallet aims to keep in its pool.
    pub target_utxo_pool_size: u32,
    /// Change outputs below this are dropped, in base units.
    pub min_change_base: u64,
}

/// The outline of a plan handed to the injected serializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanOutline {
    pub inputs: Vec<UtxoInfo>,
    pub external_outputs: Vec<PlannedOutput>,
    pub change_outputs: Vec<PlannedOutput>,
    pub fee_base: u64,
}

/// A fully planned, immutable transaction, ready for the external signer.
///
/// Invariant: the input total is exactly the sum of external outputs, change
/// outputs and the fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoPaymentPlan {
    /// Selected inputs, in selection order.
    pub inputs: Vec<UtxoInfo>,
    /// External outputs, in the order they were desired.
    pub external_outputs: Vec<PlannedOutput>,
    /// Change outputs, in weight-ascending order.
    pub change_outputs: Vec<PlannedOutput>,
    pub fee_base: u64,
    pub fee_main: String,
    pub total_change_base: u64,
    pub total_change_main: String,
    pub serialized: SerializedTx,
}

/// An error planning a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerError {
    /// Zero or missing output values, or a malformed amount.
    InvalidAmount(String),
    /// An output would end up at or below the dust threshold.
    DustOutput {
        address: String,
        value_base: u64,
        dust_threshold: u64,
    },
    /// The available inputs cannot cover the outputs plus the fee.
    InsufficientFunds { required: u64, available: u64 },
    /// A bug, not a user error: the plan failed its own accounting.
    InvariantViolation(String),
    Fee(FeeError),
    Capability(CapabilityError),
    Amount(AmountError),
}

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidAmount(e) => write!(f, "Invalid amount: {}", e),
            Self::DustOutput {
                address,
                value_base,
                dust_threshold,
            } => write!(
                f,
                "Output of {} base units to '{}' is not above the dust threshold of {}.",
                value_base, address, dust_threshold
            ),
            Self::InsufficientFunds {
                required,
                available,
            } => write!(
                f,
                "Insufficient funds: {} base units required, {} available.",
                required, available
            ),
            Self::InvariantViolation(e) => {
                write!(f, "BUG! Please report this. Plan invariant violated: {}", e)
            }
            Self::Fee(e) => write!(f, "{}", e),
            Self::Capability(e) => write!(f, "{}", e),
            Self::Amount(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PlannerError {}

impl From<FeeError> for PlannerError {
    fn from(e: FeeError) -> Self {
        Self::Fee(e)
    }
}

impl From<CapabilityError> for PlannerError {
    fn from(e: CapabilityError) -> Self {
        Self::Capability(e)
    }
}

impl From<AmountError> for PlannerError {
    fn from(e: AmountError) -> Self {
        Self::Amount(e)
    }
}

// The deterministic candidate ordering used by incremental accumulation:
// confirmed before unconfirmed, then by descending value, then by
// (txid, vout) ascending so that equal-valued coins keep a stable order.
fn sort_utxos(utxos: &mut [UtxoInfo]) {
    utxos.sort_by(|a, b| {
        b.is_confirmed()
            .cmp(&a.is_confirmed())
            .then(b.value_base.cmp(&a.value_base))
            .then_with(|| (&a.txid, a.vout).cmp(&(&b.txid, b.vout)))
    });
}

fn checked_add(a: u64, b: u64) -> Result<u64, PlannerError> {
    a.checked_add(b)
        .ok_or_else(|| PlannerError::Amount(AmountError::Overflow(format!("{} + {}", a, b))))
}

// Mutation while the plan is being put together stays local to this builder;
// it is consumed exactly once and the returned plan is immutable. A partially
// built plan is never exposed.
struct PlanBuilder {
    inputs: Vec<UtxoInfo>,
    external_outputs: Vec<OutputIntent>,
    change_outputs: Vec<OutputIntent>,
    fee_base: u64,
}

impl PlanBuilder {
    fn finish(
        self,
        config: &PlannerConfig,
        capabilities: &CoinCapabilities,
    ) -> Result<UtxoPaymentPlan, PlannerError> {
        let denom = &config.denomination;
        let to_planned = |o: &OutputIntent| PlannedOutput {
            address: o.address.clone(),
            value_base: o.value_base,
            value_main: denom.base_to_main(o.value_base),
        };
        let external_outputs: Vec<PlannedOutput> =
            self.external_outputs.iter().map(to_planned).collect();
        let change_outputs: Vec<PlannedOutput> =
            self.change_outputs.iter().map(to_planned).collect();

        let input_total = checked_sum(self.inputs.iter().map(|u| u.value_base))?;
        let external_total = checked_sum(external_outputs.iter().map(|o| o.value_base))?;
        let change_total = checked_sum(change_outputs.iter().map(|o| o.value_base))?;
        self.sanity_check(config, input_total, external_total, change_total)?;

        let outline = PlanOutline {
            inputs: self.inputs,
            external_outputs,
            change_outputs,
            fee_base: self.fee_base,
        };
        let serialized = (capabilities.serialize_plan)(&outline)?;

        Ok(UtxoPaymentPlan {
            inputs: outline.inputs,
            external_outputs: outline.external_outputs,
            change_outputs: outline.change_outputs,
            fee_base: self.fee_base,
            fee_main: denom.base_to_main(self.fee_base),
            total_change_base: change_total,
            total_change_main: denom.base_to_main(change_total),
            serialized,
        })
    }

    // The accounting must balance to the base unit, every emitted output
    // must clear the dust threshold, and the fee must clear the relay floor.
    fn sanity_check(
        &self,
        config: &PlannerConfig,
        input_total: u64,
        external_total: u64,
        change_total: u64,
    ) -> Result<(), PlannerError> {
        let spent = checked_add(checked_add(external_total, change_total)?, self.fee_base)?;
        if spent != input_total {
            log::error!(
                "Plan does not balance: {} in, {} out + {} change + {} fee.",
                input_total,
                external_total,
                change_total,
                self.fee_base
            );
            return Err(PlannerError::InvariantViolation(format!(
                "{} base units in, {} accounted for",
                input_total, spent
            )));
        }
        for output in self
            .external_outputs
            .iter()
            .chain(self.change_outputs.iter())
        {
            if output.value_base <= config.dust_threshold {
                return Err(PlannerError::InvariantViolation(format!(
                    "output of {} to '{}' below dust",
                    output.value_base, output.address
                )));
            }
        }
        if self.fee_base < config.network_min_relay_fee {
            return Err(PlannerError::InvariantViolation(format!(
                "fee {} below the relay floor {}",
                self.fee_base, config.network_min_relay_fee
            )));
        }
        Ok(())
    }
}

/// Plan a transaction spending some of `unused_utxos` to `desired_outputs`.
///
/// In targeted mode (`use_all_utxos` is false) a subset of the candidates is
/// selected: first by probing for a single input whose excess over outputs
/// and fee would be dust anyway, then by accumulating candidates in
/// deterministic order until outputs and fee are covered. Residual value is
/// split over a weighted change schedule aimed at keeping the UTXO pool at
/// its configured size.
///
/// In sweep mode every candidate becomes an input and no change output is
/// produced. When the outputs ask for exactly the input total, the fee is
/// instead deducted from the outputs, spreading it equally.
///
/// `use_unconfirmed_utxos` admits unconfirmed candidates; they sort after
/// confirmed ones.
#[allow(clippy::too_many_arguments)]
pub fn plan_transaction(
    config: &PlannerConfig,
    capabilities: &CoinCapabilities,
    unused_utxos: &[UtxoInfo],
    desired_outputs: &[OutputIntent],
    change_address: &str,
    fee_rate: &FeeRate,
    use_all_utxos: bool,
    use_unconfirmed_utxos: bool,
) -> Result<UtxoPaymentPlan, PlannerError> {
    if desired_outputs.is_empty() {
        return Err(PlannerError::InvalidAmount(
            "at least one output is required".to_string(),
        ));
    }
    for output in desired_outputs {
        if output.value_base == 0 {
            return Err(PlannerError::InvalidAmount(format!(
                "output to '{}' has no value",
                output.address
            )));
        }
        if output.value_base <= config.dust_threshold {
            return Err(PlannerError::DustOutput {
                address: output.address.clone(),
                value_base: output.value_base,
                dust_threshold: config.dust_threshold,
            });
        }
    }
    let mut external_outputs: Vec<OutputIntent> = desired_outputs.to_vec();
    let external_addresses: Vec<String> = external_outputs
        .iter()
        .map(|o| o.address.clone())
        .collect();
    let mut external_total = checked_sum(external_outputs.iter().map(|o| o.value_base))?;

    // Fee estimation for a hypothetical transaction shape, with the
    // configured floors applied.
    let estimate_fee = |input_count: usize, change_count: usize| -> Result<u64, PlannerError> {
        let size = (capabilities.estimate_size)(input_count, change_count, &external_addresses);
        let mut fee = fee_base_units(fee_rate, size, &config.denomination)?;
        if let Some(min_rate) = &config.min_tx_fee {
            fee = cmp::max(fee, fee_base_units(min_rate, size, &config.denomination)?);
        }
        Ok(cmp::max(fee, config.network_min_relay_fee))
    };

    // Unconfirmed candidates are dropped before any selection decision.
    let candidates: Vec<UtxoInfo> = unused_utxos
        .iter()
        .filter(|u| use_unconfirmed_utxos || u.is_confirmed())
        .cloned()
        .collect();

    // Mode selection: sweep takes everything, targeted mode first probes for
    // an ideal single input and otherwise accumulates.
    let mut selected: Vec<UtxoInfo>;
    let mut fee_base: u64;
    let mut target_change_count: usize = 0;
    // Whether the residual goes through the weighted change schedule.
    let mut splits_change = false;

    if use_all_utxos {
        fee_base = estimate_fee(candidates.len(), 0)?;
        selected = candidates;
    } else {
        // A single input covering outputs and fee with an excess of at most
        // the dust threshold gives a cheaper transaction, and the excess
        // would not have been worth a change output anyway.
        let fee_single = estimate_fee(1, 0)?;
        let ideal_min = checked_add(external_total, fee_single)?;
        let ideal_max = checked_add(ideal_min, config.dust_threshold)?;
        let probe = candidates
            .iter()
            .find(|u| u.value_base >= ideal_min && u.value_base <= ideal_max);
        if let Some(utxo) = probe {
            log::debug!(
                "Ideal single-input match: {} covers {} within the dust window.",
                utxo,
                ideal_min
            );
            fee_base = utxo.value_base - external_total;
            selected = vec![utxo.clone()];
        } else {
            let mut sorted = candidates.clone();
            sort_utxos(&mut sorted);
            let candidate_count = sorted.len();
            selected = Vec::new();
            let mut selected_total: u64 = 0;
            fee_base = fee_single;
            let mut covered = false;
            for utxo in sorted {
                selected_total = checked_add(selected_total, utxo.value_base)?;
                selected.push(utxo);
                // Aim for a change count that tops the pool back up to its
                // configured size once these inputs are spent.
                let remaining = candidate_count - selected.len();
                target_change_count = cmp::max(
                    1,
                    (config.target_utxo_pool_size as usize).saturating_sub(remaining),
                );
                fee_base = estimate_fee(selected.len(), target_change_count)?;
                if selected_total >= checked_add(external_total, fee_base)? {
                    covered = true;
                    break;
                }
            }
            splits_change = true;
            if !covered {
                log::debug!(
                    "Candidates exhausted below target: {} selected, {} required.",
                    selected_total,
                    external_total.saturating_add(fee_base)
                );
            }
        }
    }

    let input_total = checked_sum(selected.iter().map(|u| u.value_base))?;

    // Shortfall handling: a caller spending its exact balance gets the fee
    // deducted from the outputs instead of an error.
    if checked_add(external_total, fee_base)? > input_total {
        if external_total == input_total {
            let output_count = external_outputs.len() as u64;
            let fee_share = (fee_base + output_count - 1) / output_count;
            fee_base = fee_share * output_count;
            for output in external_outputs.iter_mut() {
                let remaining = output.value_base.checked_sub(fee_share).unwrap_or(0);
                if remaining <= config.dust_threshold {
                    return Err(PlannerError::DustOutput {
                        address: output.address.clone(),
                        value_base: remaining,
                        dust_threshold: config.dust_threshold,
                    });
                }
                output.value_base = remaining;
            }
            external_total = checked_sum(external_outputs.iter().map(|o| o.value_base))?;
        } else {
            return Err(PlannerError::InsufficientFunds {
                required: checked_add(external_total, fee_base)?,
                available: input_total,
            });
        }
    }

    let mut total_change = input_total
        .checked_sub(external_total)
        .and_then(|v| v.checked_sub(fee_base))
        .ok_or_else(|| {
            log::error!(
                "Negative change: {} in, {} out, {} fee.",
                input_total,
                external_total,
                fee_base
            );
            PlannerError::InvariantViolation(format!(
                "negative total change ({} in, {} out, {} fee)",
                input_total, external_total, fee_base
            ))
        })?;

    let mut change_outputs: Vec<OutputIntent> = Vec::new();
    if splits_change {
        let (outputs, reconciled_fee) = split_change(
            config,
            &estimate_fee,
            total_change,
            target_change_count,
            selected.len(),
            change_address,
            fee_base,
        )?;
        change_outputs = outputs;
        fee_base = reconciled_fee;
    } else if total_change > 0 {
        // Sweep never emits change, and a probe-selected input's excess is
        // already accounted as fee. Whatever is left goes to the fee.
        fee_base = checked_add(fee_base, total_change)?;
    }
    total_change = checked_sum(change_outputs.iter().map(|o| o.value_base))?;
    debug_assert_eq!(
        input_total,
        external_total + total_change + fee_base,
        "plan accounting must balance"
    );

    let builder = PlanBuilder {
        inputs: selected,
        external_outputs,
        change_outputs,
        fee_base,
    };
    builder.finish(config, capabilities)
}

// Distribute the residual over a weighted change schedule, then reconcile
// the loose base units the integer division left over.
fn split_change(
    config: &PlannerConfig,
    estimate_fee: &dyn Fn(usize, usize) -> Result<u64, PlannerError>,
    total_change: u64,
    target_change_count: usize,
    input_count: usize,
    change_address: &str,
    mut fee_base: u64,
) -> Result<(Vec<OutputIntent>, u64), PlannerError> {
    // Weights 2^0, 2^1, .., so later outputs are exponentially larger and a
    // wallet accumulates a spread of denominations. The weight sum must fit
    // in a u64, which bounds the schedule length.
    let target_change_count = cmp::min(target_change_count, 63);
    let weights: Vec<u64> = (0..target_change_count).map(|i| 1u64 << i).collect();
    let weight_total: u64 = weights.iter().sum();
    let min_keep = cmp::max(config.dust_threshold, config.min_change_base);

    let mut change_outputs: Vec<OutputIntent> = Vec::new();
    let mut allocated: u64 = 0;
    for weight in &weights {
        let share =
            (u128::from(total_change) * u128::from(*weight) / u128::from(weight_total)) as u64;
        if share <= min_keep {
            log::debug!(
                "Dropping change share of {} (threshold {}).",
                share,
                min_keep
            );
            continue;
        }
        allocated += share;
        change_outputs.push(OutputIntent::new(change_address, share));
    }
    let mut loose = total_change - allocated;

    // The fee was estimated against the target change count; with shares
    // dropped the transaction is smaller. Reclaim the difference as loose
    // change rather than overpaying.
    let actual_count = cmp::max(change_outputs.len(), 1);
    let reestimated = estimate_fee(input_count, actual_count)?;
    if reestimated < fee_base {
        loose = checked_add(loose, fee_base - reestimated)?;
        fee_base = reestimated;
    }

    if !change_outputs.is_empty() {
        let count = change_outputs.len() as u64;
        if loose >= count {
            let per_output = loose / count;
            for output in change_outputs.iter_mut() {
                output.value_base = checked_add(output.value_base, per_output)?;
            }
            loose -= per_output * count;
        }
    } else if loose > min_keep {
        change_outputs.push(OutputIntent::new(change_address, loose));
        loose = 0;
    }
    // Whatever is left is not worth an output; the fee absorbs it.
    fee_base = checked_add(fee_base, loose)?;

    Ok((change_outputs, fee_base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capability::SerializedTx, fee::FeeRateType};

    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn test_capabilities() -> CoinCapabilities {
        CoinCapabilities::new(
            Box::new(|addr: &str| !addr.is_empty()),
            Box::new(|index| Ok(format!("addr{}", index))),
            Box::new(|outline: &PlanOutline| {
                let hex = serde_json::to_string(outline)
                    .map_err(|e| CapabilityError::Serialization(e.to_string()))?;
                let mut hasher = DefaultHasher::new();
                hex.hash(&mut hasher);
                Ok(SerializedTx {
                    hash: format!("{:016x}", hasher.finish()),
                    hex,
                })
            }),
        )
    }

    fn test_config() -> PlannerConfig {
        PlannerConfig {
            denomination: Denomination::new(8),
            dust_threshold: 546,
            network_min_relay_fee: 1000,
            min_tx_fee: None,
            target_utxo_pool_size: 1,
            min_change_base: 0,
        }
    }

    fn utxo(txid: &str, value: u64) -> UtxoInfo {
        UtxoInfo::from_base(txid, 0, value, &Denomination::new(8)).confirmed_at(100)
    }

    fn rate(r: &str) -> FeeRate {
        FeeRate::per_weight(r)
    }

    fn assert_balances(plan: &UtxoPaymentPlan, config: &PlannerConfig) {
        let in_total: u64 = plan.inputs.iter().map(|u| u.value_base).sum();
        let out_total: u64 = plan.external_outputs.iter().map(|o| o.value_base).sum();
        let change_total: u64 = plan.change_outputs.iter().map(|o| o.value_base).sum();
        assert_eq!(in_total, out_total + change_total + plan.fee_base);
        assert_eq!(change_total, plan.total_change_base);
        for output in plan
            .external_outputs
            .iter()
            .chain(plan.change_outputs.iter())
        {
            assert!(output.value_base > config.dust_threshold);
        }
        assert!(plan.fee_base >= config.network_min_relay_fee);
    }

    #[test]
    fn ideal_single_input_probe() {
        let config = test_config();
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 10_000), utxo("bb", 50_000)];
        let outputs = vec![OutputIntent::new("dest", 8_000)];

        // fee for (1 in, 1 out, no change) is 10 * 192 = 1920; the ideal
        // window is [9_920, 10_466] and the 10_000 coin falls inside it.
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), false, false,
        )
        .unwrap();

        assert_eq!(plan.inputs.len(), 1);
        assert_eq!(plan.inputs[0].txid, "aa");
        assert_eq!(plan.external_outputs.len(), 1);
        assert_eq!(plan.external_outputs[0].value_base, 8_000);
        assert!(plan.change_outputs.is_empty());
        assert_eq!(plan.fee_base, 2_000);
        assert_eq!(plan.fee_main, "0.00002");
        assert_eq!(plan.total_change_base, 0);
        assert_balances(&plan, &config);
    }

    #[test]
    fn probe_iterates_in_original_order() {
        let config = test_config();
        let caps = test_capabilities();
        // Both coins fall in the ideal window; the first by input order wins
        // even though sorting would prefer the larger one.
        let utxos = vec![utxo("first", 10_000), utxo("second", 10_200)];
        let outputs = vec![OutputIntent::new("dest", 8_000)];
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), false, false,
        )
        .unwrap();
        assert_eq!(plan.inputs[0].txid, "first");
    }

    #[test]
    fn sweep_two_utxos_subtracts_the_fee() {
        let config = test_config();
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 30_000), utxo("bb", 20_000)];
        let outputs = vec![OutputIntent::new("dest", 50_000)];

        // size 10 + 2*148 + 34 = 340, fee 3_400 at 10 base/weight.
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), true, false,
        )
        .unwrap();

        assert_eq!(plan.inputs.len(), 2);
        assert_eq!(plan.external_outputs[0].value_base, 46_600);
        assert_eq!(plan.fee_base, 3_400);
        assert!(plan.change_outputs.is_empty());
        assert_balances(&plan, &config);
    }

    #[test]
    fn sweep_mode_never_emits_change() {
        let config = test_config();
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 30_000), utxo("bb", 20_000)];
        // Asking for less than the input total in sweep mode burns the
        // residual as fee rather than producing change.
        let outputs = vec![OutputIntent::new("dest", 40_000)];
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), true, false,
        )
        .unwrap();
        assert!(plan.change_outputs.is_empty());
        assert_eq!(plan.fee_base, 10_000);
        assert_balances(&plan, &config);
    }

    #[test]
    fn multi_change_pool_fill() {
        let mut config = test_config();
        config.target_utxo_pool_size = 4;
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 1_000_000)];
        let outputs = vec![OutputIntent::new("dest", 100_000)];

        // One candidate, all of it selected: the change schedule aims for
        // max(1, 4 - 0) = 4 outputs. size 10 + 148 + 5*34 = 328, fee 3_280.
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), false, false,
        )
        .unwrap();

        assert_eq!(plan.change_outputs.len(), 4);
        let values: Vec<u64> = plan.change_outputs.iter().map(|o| o.value_base).collect();
        // 896_720 split over weights 1, 2, 4, 8; the 2 loose base units are
        // absorbed into the fee.
        assert_eq!(values, vec![59_781, 119_562, 239_125, 478_250]);
        assert_eq!(plan.fee_base, 3_282);
        // Weight-ascending change output ordering.
        let mut sorted = values.clone();
        sorted.sort_unstable();
        assert_eq!(values, sorted);
        assert_balances(&plan, &config);
    }

    #[test]
    fn dust_change_share_flows_back_to_fee() {
        let config = test_config();
        let caps = test_capabilities();
        // Residual of 240 after fees is below dust: no change output, the
        // 240 ends up in the fee.
        let utxos = vec![utxo("aa", 10_500)];
        let outputs = vec![OutputIntent::new("dest", 8_000)];
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), false, false,
        )
        .unwrap();
        assert!(plan.change_outputs.is_empty());
        assert_eq!(plan.fee_base, 2_500);
        assert_balances(&plan, &config);
    }

    #[test]
    fn dropped_share_redistributes_over_survivors() {
        let mut config = test_config();
        config.target_utxo_pool_size = 2;
        config.network_min_relay_fee = 100;
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 12_000)];
        let outputs = vec![OutputIntent::new("dest", 8_000)];

        // Change of 1_400 splits 466/933 over weights 1/2; the 466 share is
        // dust and is dropped. Re-estimating the fee for a single change
        // output refunds 340, and the whole loose amount lands on the
        // surviving output.
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), false, false,
        )
        .unwrap();
        assert_eq!(plan.change_outputs.len(), 1);
        assert_eq!(plan.change_outputs[0].value_base, 1_740);
        assert_eq!(plan.fee_base, 2_260);
        assert_balances(&plan, &config);
    }

    #[test]
    fn refunded_fee_can_become_a_change_output() {
        let mut config = test_config();
        config.target_utxo_pool_size = 4;
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 15_500)];
        let outputs = vec![OutputIntent::new("dest", 8_000)];

        // At 20 base/weight the fee for 4 change outputs is 6_560 and every
        // schedule share of the 940 residual is dust. Re-estimating for the
        // single-change shape refunds 2_040, which is enough to emit one
        // change output of 2_980.
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("20"), false, false,
        )
        .unwrap();
        assert_eq!(plan.change_outputs.len(), 1);
        assert_eq!(plan.change_outputs[0].value_base, 2_980);
        assert_eq!(plan.fee_base, 4_520);
        assert_balances(&plan, &config);
    }

    #[test]
    fn min_change_drops_small_outputs() {
        let mut config = test_config();
        config.min_change_base = 2_000;
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 12_000)];
        let outputs = vec![OutputIntent::new("dest", 8_000)];

        // The 1_740 residual clears dust but not the configured minimum
        // change, so it is absorbed into the fee.
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), false, false,
        )
        .unwrap();
        assert!(plan.change_outputs.is_empty());
        assert_eq!(plan.fee_base, 4_000);
        assert_balances(&plan, &config);
    }

    #[test]
    fn insufficient_funds() {
        let config = test_config();
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 5_000)];
        let outputs = vec![OutputIntent::new("dest", 10_000)];
        let err = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), false, false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlannerError::InsufficientFunds {
                required: 12_260,
                available: 5_000
            }
        );
    }

    #[test]
    fn exact_balance_send_becomes_a_fee_subtraction_sweep() {
        let config = test_config();
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 30_000), utxo("bb", 20_000)];
        let outputs = vec![
            OutputIntent::new("dest1", 30_000),
            OutputIntent::new("dest2", 20_000),
        ];

        // Accumulation selects both coins but cannot cover the fee on top of
        // the full balance: the fee is split equally over the outputs.
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), false, false,
        )
        .unwrap();
        assert_eq!(plan.external_outputs[0].value_base, 27_960);
        assert_eq!(plan.external_outputs[1].value_base, 17_960);
        assert_eq!(plan.fee_base, 4_080);
        assert!(plan.change_outputs.is_empty());
        assert_balances(&plan, &config);
    }

    #[test]
    fn fee_subtraction_dust_output_fails() {
        let config = test_config();
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 1_000), utxo("bb", 1_000)];
        let outputs = vec![OutputIntent::new("dest", 2_000)];
        let err = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), true, false,
        )
        .unwrap_err();
        assert!(matches!(err, PlannerError::DustOutput { .. }));
    }

    #[test]
    fn unconfirmed_utxos_are_filtered_out() {
        let config = test_config();
        let caps = test_capabilities();
        let unconfirmed = UtxoInfo::from_base("mempool", 0, 50_000, &Denomination::new(8));
        let utxos = vec![unconfirmed.clone(), utxo("aa", 10_000)];
        let outputs = vec![OutputIntent::new("dest", 8_000)];

        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), false, false,
        )
        .unwrap();
        assert!(plan.inputs.iter().all(|u| u.is_confirmed()));

        // Admitting unconfirmed coins puts the mempool coin back in play;
        // the probe still prefers the confirmed one as it comes later in
        // input order but matches the ideal window.
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("10"), false, true,
        )
        .unwrap();
        assert_eq!(plan.inputs[0].txid, "aa");

        // With nothing but unconfirmed coins and permission to use them,
        // they get selected.
        let only_unconfirmed = vec![unconfirmed];
        let plan = plan_transaction(
            &config,
            &caps,
            &only_unconfirmed,
            &outputs,
            "change",
            &rate("10"),
            false,
            true,
        )
        .unwrap();
        assert_eq!(plan.inputs[0].txid, "mempool");
        assert_balances(&plan, &config);
    }

    #[test]
    fn accumulation_order_is_deterministic() {
        let mut utxos = vec![
            UtxoInfo::from_base("unconf", 0, 90_000, &Denomination::new(8)),
            utxo("small", 20_000),
            utxo("big", 80_000),
            {
                let mut u = utxo("tie-b", 50_000);
                u.vout = 1;
                u
            },
            utxo("tie-a", 50_000),
        ];
        sort_utxos(&mut utxos);
        let order: Vec<&str> = utxos.iter().map(|u| u.txid.as_str()).collect();
        // Confirmed first by descending value, (txid, vout) breaking the
        // tie, unconfirmed last.
        assert_eq!(order, vec!["big", "tie-a", "tie-b", "small", "unconf"]);
    }

    #[test]
    fn plans_are_byte_identical_across_runs() {
        let mut config = test_config();
        config.target_utxo_pool_size = 3;
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 40_000), utxo("bb", 35_000), utxo("cc", 90_000)];
        let outputs = vec![
            OutputIntent::new("dest1", 25_000),
            OutputIntent::new("dest2", 30_000),
        ];
        let plan = |_| {
            plan_transaction(
                &config, &caps, &utxos, &outputs, "change", &rate("7"), false, false,
            )
            .unwrap()
        };
        let first = plan(());
        let second = plan(());
        assert_eq!(first, second);
        assert_eq!(first.serialized.hex, second.serialized.hex);
        assert_eq!(first.serialized.hash, second.serialized.hash);
        assert_balances(&first, &config);
    }

    #[test]
    fn fee_floors_apply() {
        let mut config = test_config();
        config.min_tx_fee = Some(FeeRate::new("0.00002", FeeRateType::Main));
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 100_000)];
        let outputs = vec![OutputIntent::new("dest", 8_000)];

        // At 0.1 base/weight the computed fee (23) is under both floors;
        // the min-tx-fee floor (2_000) dominates the relay floor (1_000).
        let plan = plan_transaction(
            &config, &caps, &utxos, &outputs, "change", &rate("0.1"), false, false,
        )
        .unwrap();
        assert_eq!(plan.fee_base, 2_000);
        assert_balances(&plan, &config);
    }

    #[test]
    fn degenerate_outputs_are_rejected() {
        let config = test_config();
        let caps = test_capabilities();
        let utxos = vec![utxo("aa", 100_000)];

        assert!(matches!(
            plan_transaction(&config, &caps, &utxos, &[], "change", &rate("10"), false, false),
            Err(PlannerError::InvalidAmount(_))
        ));
        assert!(matches!(
            plan_transaction(
                &config,
                &caps,
                &utxos,
                &[OutputIntent::new("dest", 0)],
                "change",
                &rate("10"),
                false,
                false
            ),
            Err(PlannerError::InvalidAmount(_))
        ));
        assert!(matches!(
            plan_transaction(
                &config,
                &caps,
                &utxos,
                &[OutputIntent::new("dest", 500)],
                "change",
                &rate("10"),
                false,
                false
            ),
            Err(PlannerError::DustOutput { .. })
        ));
    }
}
