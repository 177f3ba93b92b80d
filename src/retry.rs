//! Fixed-delay retry around a fallible async operation.
//!
//! Only [`Error::Transient`] failures are retried. Everything else is
//! returned as-is on the first occurrence. Once the attempts are used up the
//! last transient error is wrapped into [`Error::RetryExhausted`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Holds no mutable state, so one policy can be shared by every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Runs `operation` until it succeeds, fails for good, or runs out of attempts.
    ///
    /// The delay sits between attempts, so `max_attempts` failures cost
    /// `max_attempts - 1` delays. Cancellation is only observed during the
    /// delay: an attempt already in flight always completes.
    pub async fn run<F, Fut, T>(
        &self,
        roll: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(roll, attempts = attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        roll,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Retry error"
                    );
                    if attempt >= self.max_attempts {
                        return Err(Error::RetryExhausted {
                            roll: roll.to_string(),
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
