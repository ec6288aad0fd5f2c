//! The live subscription bridge.
//!
//! Maps server-pushed payment events into the same [`BalanceActivity`]
//! records the historical scanner emits, for a set of watched addresses.
//! The monitor is a cancellable sequence the caller drains, either one
//! activity at a time or by forwarding into a sink.

use std::{
    collections::VecDeque,
    sync::{mpsc, Mutex},
    time::Duration,
};

use payrail::activity::BalanceActivity;

use crate::{
    config::LedgerCoinConfig,
    ledger::{
        scanner::{tx_to_activity, ActivitySink, ScanError},
        LedgerError, LedgerNode, LedgerTx,
    },
    retry::RetryPolicy,
    CancelHandle,
};

// How often the blocking iterator rechecks the cancellation flag.
const DRAIN_POLL: Duration = Duration::from_millis(250);

/// A drainable stream of live balance activities for a set of addresses.
///
/// Events concerning several watched addresses yield one activity per
/// address. Classification failures on single events are not fatal when
/// draining through the [`Iterator`] interface; they are logged and the
/// event is skipped.
pub struct BalanceMonitor<'a, L: LedgerNode> {
    node: &'a Mutex<L>,
    retry: &'a RetryPolicy,
    config: &'a LedgerCoinConfig,
    addresses: Vec<String>,
    events: mpsc::Receiver<LedgerTx>,
    pending: VecDeque<BalanceActivity>,
    cancel: CancelHandle,
}

impl<'a, L: LedgerNode> BalanceMonitor<'a, L> {
    pub(crate) fn new(
        node: &'a Mutex<L>,
        retry: &'a RetryPolicy,
        config: &'a LedgerCoinConfig,
        addresses: Vec<String>,
        events: mpsc::Receiver<LedgerTx>,
        cancel: CancelHandle,
    ) -> BalanceMonitor<'a, L> {
        BalanceMonitor {
            node,
            retry,
            config,
            addresses,
            events,
            pending: VecDeque::new(),
            cancel,
        }
    }

    /// Wait up to `timeout` for the next activity. `Ok(None)` means no
    /// event arrived in time; a closed event stream is a transport
    /// disconnection.
    pub fn next_activity(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<BalanceActivity>, ScanError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if let Some(activity) = self.pending.pop_front() {
                return Ok(Some(activity));
            }
            match self.events.recv_timeout(timeout) {
                Ok(tx) => {
                    log::debug!("Received a pushed transaction event: {}.", tx.id);
                    for address in &self.addresses {
                        if let Some(activity) =
                            tx_to_activity(self.node, self.retry, self.config, address, &tx)?
                        {
                            self.pending.push_back(activity);
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => return Ok(None),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(ScanError::Ledger(LedgerError::TransportDisconnected(
                        "the event stream closed".to_string(),
                    )))
                }
            }
        }
    }

    /// Forward activities into `sink` until the event stream closes. A sink
    /// failure or cancellation aborts with the error.
    pub fn forward(mut self, sink: &mut ActivitySink<'_>) -> Result<(), ScanError> {
        loop {
            match self.next_activity(DRAIN_POLL) {
                Ok(Some(activity)) => sink(activity).map_err(ScanError::Sink)?,
                Ok(None) => continue,
                Err(ScanError::Ledger(LedgerError::TransportDisconnected(_))) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<'a, L: LedgerNode> Iterator for BalanceMonitor<'a, L> {
    type Item = BalanceActivity;

    // Blocks until the next activity, the end of the stream, or
    // cancellation.
    fn next(&mut self) -> Option<BalanceActivity> {
        loop {
            match self.next_activity(DRAIN_POLL) {
                Ok(Some(activity)) => return Some(activity),
                Ok(None) => continue,
                Err(ScanError::Cancelled)
                | Err(ScanError::Ledger(LedgerError::TransportDisconnected(_))) => return None,
                Err(e) => {
                    log::warn!("Skipping an unclassifiable event: {}", e);
                    continue;
                }
            }
        }
    }
}
