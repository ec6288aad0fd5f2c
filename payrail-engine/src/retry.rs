//! Reconnect-and-retry for idempotent ledger reads.
//!
//! Transport disconnections are a fact of life with long-lived websocket
//! connections to ledger servers. Rather than wrapping the whole facade, a
//! retry policy is applied at the call sites that are known to be idempotent
//! reads. Anything that is not a transport disconnection propagates
//! immediately.

use std::{cmp, sync::Mutex, thread, time::Duration};

use crate::ledger::{LedgerError, LedgerNode};

/// Exponential backoff parameters for reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How many reconnect-and-retry rounds to attempt.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// The backoff delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.factor.saturating_pow(attempt);
        cmp::min(self.max_delay, self.initial_delay.saturating_mul(factor))
    }
}

/// Run an idempotent read against the node, reconnecting and retrying on
/// transport disconnection.
///
/// The lock is only held for the duration of each call, never across the
/// backoff sleeps.
pub fn with_reconnect<L, T, F>(
    policy: &RetryPolicy,
    node: &Mutex<L>,
    mut operation: F,
) -> Result<T, LedgerError>
where
    L: LedgerNode,
    F: FnMut(&L) -> Result<T, LedgerError>,
{
    let mut attempt: u32 = 0;
    loop {
        let result = {
            let locked = node.lock().expect("ledger node mutex must not be poisoned");
            operation(&locked)
        };
        let disconnect = match result {
            Ok(value) => return Ok(value),
            Err(LedgerError::TransportDisconnected(e)) => e,
            Err(e) => return Err(e),
        };
        if attempt >= policy.max_attempts {
            return Err(LedgerError::TransportDisconnected(disconnect));
        }
        let delay = policy.delay_for(attempt);
        log::warn!(
            "Transport disconnected ('{}'). Reconnecting in {}ms, attempt {}/{}.",
            disconnect,
            delay.as_millis(),
            attempt + 1,
            policy.max_attempts
        );
        thread::sleep(delay);
        {
            let mut locked = node.lock().expect("ledger node mutex must not be poisoned");
            if !locked.is_connected() {
                if let Err(e) = locked.connect() {
                    // The next round will back off further and try again.
                    log::warn!("Reconnection attempt failed: {}", e);
                }
            }
        }
        attempt += 1;
    }
}
