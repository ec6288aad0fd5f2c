//! Historical balance-activity reconstruction.
//!
//! Pages through the payment history of an address within a bounded ledger
//! window, classifies each transaction against the address, and emits
//! [`BalanceActivity`] records in strictly increasing activity-sequence
//! order into a caller-supplied sink.

use std::{fmt, sync::Mutex};

use payrail::activity::{activity_sequence, ActivityDirection, BalanceActivity};

use crate::{
    config::LedgerCoinConfig,
    ledger::{LedgerError, LedgerNode, LedgerTx, TxQueryOptions},
    retry::{with_reconnect, RetryPolicy},
    CancelHandle,
};

/// The caller-supplied activity sink. It is invoked sequentially and
/// awaited before the next emission; returning an error halts the scan.
pub type ActivitySink<'a> = dyn FnMut(BalanceActivity) -> Result<(), String> + 'a;

/// A bound of the requested scan window: either a ledger height, or a
/// previously emitted activity whose confirmation number is resumed from.
#[derive(Debug, Clone)]
pub enum LedgerBound {
    Height(u64),
    Activity(BalanceActivity),
}

impl LedgerBound {
    fn height(&self) -> u64 {
        match self {
            Self::Height(height) => *height,
            Self::Activity(activity) => activity.confirmation_number,
        }
    }
}

impl From<u64> for LedgerBound {
    fn from(height: u64) -> Self {
        Self::Height(height)
    }
}

impl From<BalanceActivity> for LedgerBound {
    fn from(activity: BalanceActivity) -> Self {
        Self::Activity(activity)
    }
}

/// The requested scan window. Bounds default to the server's full retained
/// range, and are silently narrowed to it when they reach beyond.
#[derive(Debug, Clone, Default)]
pub struct ActivityScanOptions {
    pub from: Option<LedgerBound>,
    pub to: Option<LedgerBound>,
}

/// The ledger window a scan actually covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub from: u64,
    pub to: u64,
}

/// An error aborting a scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanError {
    Ledger(LedgerError),
    /// The caller's sink refused an activity; the scan halts there.
    Sink(String),
    Cancelled,
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ledger(e) => write!(f, "{}", e),
            Self::Sink(e) => write!(f, "Activity sink error: {}", e),
            Self::Cancelled => write!(f, "The scan was cancelled."),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<LedgerError> for ScanError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}

/// Parse a server's "min-max" retained ledger range.
pub(crate) fn parse_ledger_range(range: &str) -> Result<(u64, u64), LedgerError> {
    let mut parts = range.trim().splitn(2, '-');
    let oldest = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| LedgerError::InvalidLedgerRange(range.to_string()))?;
    let newest = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|newest| *newest >= oldest)
        .ok_or_else(|| LedgerError::InvalidLedgerRange(range.to_string()))?;
    Ok((oldest, newest))
}

// Intersect the requested bounds with what the server retains. Asking for
// more than is available is not an error, but it is worth a diagnostic.
fn resolve_window(available: (u64, u64), options: &ActivityScanOptions) -> (u64, u64) {
    let (oldest, newest) = available;
    let requested_from = options.from.as_ref().map(LedgerBound::height).unwrap_or(oldest);
    let requested_to = options.to.as_ref().map(LedgerBound::height).unwrap_or(newest);
    let from = if requested_from < oldest {
        log::warn!(
            "Requested scan start {} predates the server's retained history, narrowing to {}.",
            requested_from,
            oldest
        );
        oldest
    } else {
        requested_from
    };
    let to = if requested_to > newest {
        log::warn!(
            "Requested scan end {} is beyond the server's retained history, narrowing to {}.",
            requested_to,
            newest
        );
        newest
    } else {
        requested_to
    };
    (from, to)
}

/// Classify a reported transaction against `address`, turning it into a
/// balance activity if it moved the native asset for that address.
///
/// Non-payments, failures, transactions not concerning the address and
/// token-only movements yield `None` with a diagnostic; they are skipped,
/// never fatal.
pub(crate) fn tx_to_activity<L: LedgerNode>(
    node: &Mutex<L>,
    retry: &RetryPolicy,
    config: &LedgerCoinConfig,
    address: &str,
    tx: &LedgerTx,
) -> Result<Option<BalanceActivity>, ScanError> {
    if !tx.tx_type.eq_ignore_ascii_case("payment") {
        log::debug!("Transaction {} is a {}, not a payment.", tx.id, tx.tx_type);
        return Ok(None);
    }
    if !tx.successful {
        log::debug!("Transaction {} did not succeed.", tx.id);
        return Ok(None);
    }
    let direction = if tx.source.address == address {
        ActivityDirection::Out
    } else if tx.destination.address == address {
        ActivityDirection::In
    } else {
        log::debug!(
            "Transaction {} concerns neither side of address {}.",
            tx.id,
            address
        );
        return Ok(None);
    };
    let changes = match tx.balance_changes.get(address) {
        Some(changes) => changes,
        None => {
            log::warn!(
                "Transaction {} has no balance change entry for {}; cannot determine the amount.",
                tx.id,
                address
            );
            return Ok(None);
        }
    };
    let change = match changes
        .iter()
        .find(|c| c.symbol == config.coin.asset_symbol)
    {
        Some(change) => change,
        None => {
            log::warn!(
                "Transaction {} only moved non-native assets for {}.",
                tx.id,
                address
            );
            return Ok(None);
        }
    };
    // The ledger header provides the confirmation id and the authoritative
    // close time.
    let header = with_reconnect(retry, node, |n| n.get_ledger(tx.ledger_version))?;
    Ok(Some(BalanceActivity {
        direction,
        network_type: config.coin.network_type,
        asset_symbol: config.coin.asset_symbol.clone(),
        address: address.to_string(),
        extra_id: tx.destination.tag.clone(),
        amount_main: change.amount_main.clone(),
        external_id: tx.id.clone(),
        activity_sequence: activity_sequence(tx.ledger_version, tx.index_in_ledger, direction),
        confirmation_id: header.ledger_hash,
        confirmation_number: tx.ledger_version,
        timestamp_secs: header.close_time_secs,
    }))
}

/// Page through the payment history of `address` within the requested
/// window, invoking `sink` sequentially for every classified activity.
///
/// The first page is seeded with the window bounds; every following page
/// resumes from the previous page's last transaction, which also appears in
/// the next page and is de-duplicated here. The scan stops on a short page
/// or once past the window's end. A sink failure aborts the scan with it.
pub(crate) fn scan_activities<L: LedgerNode>(
    node: &Mutex<L>,
    retry: &RetryPolicy,
    config: &LedgerCoinConfig,
    address: &str,
    sink: &mut ActivitySink<'_>,
    options: &ActivityScanOptions,
    cancel: &CancelHandle,
) -> Result<ScanOutcome, ScanError> {
    let info = with_reconnect(retry, node, |n| n.get_server_info())?;
    let available = parse_ledger_range(&info.complete_ledgers)?;
    let (from, to) = resolve_window(available, options);
    log::debug!(
        "Scanning balance activities of {} over ledgers {}..={}.",
        address,
        from,
        to
    );

    let page_size = config.activity_page_size;
    let mut cursor: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let query = TxQueryOptions {
            earliest_first: true,
            exclude_failures: true,
            limit: page_size,
            min_ledger_version: if cursor.is_none() { Some(from) } else { None },
            max_ledger_version: if cursor.is_none() { Some(to) } else { None },
            start_tx_id: cursor.clone(),
        };
        let page = with_reconnect(retry, node, |n| n.get_transactions(address, &query))?;
        log::debug!("Got a page of {} transactions for {}.", page.len(), address);

        let page_len = page.len();
        let mut last_ledger: u64 = 0;
        for tx in &page {
            last_ledger = tx.ledger_version;
            if cursor.as_deref() == Some(tx.id.as_str()) {
                // The resume cursor reappears at the top of each page.
                continue;
            }
            if tx.ledger_version < from || tx.ledger_version > to {
                log::debug!(
                    "Transaction {} at ledger {} is outside the scanned window.",
                    tx.id,
                    tx.ledger_version
                );
                continue;
            }
            if let Some(activity) = tx_to_activity(node, retry, config, address, tx)? {
                if cancel.is_cancelled() {
                    return Err(ScanError::Cancelled);
                }
                sink(activity).map_err(ScanError::Sink)?;
            }
        }
        cursor = page.last().map(|tx| tx.id.clone());
        if page_len < page_size as usize || last_ledger > to {
            break;
        }
    }
    Ok(ScanOutcome { from, to })
}
