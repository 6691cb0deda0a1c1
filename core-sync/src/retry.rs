//! Bounded retry of asset-level operations
//!
//! ```text
//! Attempt(n) ──ok──────────────────────────▶ Success
//!     │
//!     └─err─▶ retryable && n < max_attempts ─▶ Retry(n+1, delay)
//!                          otherwise ────────▶ GiveUp
//! ```
//!
//! [`RetryMachine`] is pure; [`retry`] drives it with real sleeps.

use std::future::Future;
use std::time::Duration;

use core_runtime::config::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::AssetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Success,
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 1 }
    }

    /// The 1-based number of the attempt about to run (or just run).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Feed the outcome of the current attempt and advance.
    pub fn record<T>(&mut self, outcome: &Result<T, AssetError>) -> RetryDecision {
        match outcome {
            Ok(_) => RetryDecision::Success,
            Err(e) if e.is_retryable() && self.attempt < self.policy.max_attempts => {
                self.attempt += 1;
                RetryDecision::Retry {
                    attempt: self.attempt,
                    delay: self.policy.delay_before(self.attempt),
                }
            }
            Err(_) => RetryDecision::GiveUp,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Cancellation interrupts the backoff sleep and returns the last error.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, AssetError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AssetError>>,
{
    let mut machine = RetryMachine::new(policy);
    loop {
        let outcome = op(machine.attempt()).await;
        match machine.record(&outcome) {
            RetryDecision::Success | RetryDecision::GiveUp => return outcome,
            RetryDecision::Retry { attempt, delay } => {
                if let Err(e) = &outcome {
                    warn!(
                        operation = what,
                        attempt,
                        max_attempts = policy.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                }
                tokio::select! {
                    _ = cancel.cancelled() => return outcome,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::NetworkError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn transient() -> AssetError {
        NetworkError::from_status(503, "busy").into()
    }

    #[test]
    fn test_machine_transitions() {
        let mut machine = RetryMachine::new(policy(3));
        assert_eq!(machine.attempt(), 1);

        let failed: Result<(), _> = Err(transient());
        assert_eq!(
            machine.record(&failed),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_millis(1)
            }
        );
        assert_eq!(
            machine.record(&failed),
            RetryDecision::Retry {
                attempt: 3,
                delay: Duration::from_millis(2)
            }
        );
        assert_eq!(machine.record(&failed), RetryDecision::GiveUp);
    }

    #[test]
    fn test_permanent_error_gives_up_immediately() {
        let mut machine = RetryMachine::new(policy(5));
        let failed: Result<(), _> = Err(AssetError::Malformed("bad".into()));
        assert_eq!(machine.record(&failed), RetryDecision::GiveUp);
        assert_eq!(machine.attempt(), 1);
    }

    #[test]
    fn test_success() {
        let mut machine = RetryMachine::new(policy(1));
        assert_eq!(machine.record(&Ok::<_, AssetError>(1)), RetryDecision::Success);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = retry(policy(3), &cancel, "fetch", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry(policy(2), &cancel, "fetch", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let slow = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(slow, &cancel, "fetch", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
