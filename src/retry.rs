//! Bounded retry and polling
//!
//! Every long external wait in a job step goes through one of these two
//! helpers so that it is bounded by attempt count and, optionally, by an
//! overall deadline. Exhaustion is an error for the step, never a hang.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::adapters::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    /// Doubles per attempt, capped at `max_delay_ms`
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: Backoff,
    #[serde(default)]
    pub max_delay_ms: u64,
    /// Overall deadline across all attempts
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            backoff: Backoff::Fixed,
            max_delay_ms: delay.as_millis() as u64,
            timeout_ms: None,
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: initial.as_millis() as u64,
            backoff: Backoff::Exponential,
            max_delay_ms: cap.as_millis() as u64,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// A single attempt, no waiting.
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => Duration::from_millis(self.delay_ms),
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                let raw = self.delay_ms.saturating_mul(1u64 << shift);
                let cap = if self.max_delay_ms == 0 {
                    raw
                } else {
                    self.max_delay_ms
                };
                Duration::from_millis(raw.min(cap))
            }
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `f` until it succeeds, retrying only transient adapter errors.
///
/// On exhaustion the last provider error is returned unchanged.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    mut f: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let attempts = policy.attempts();
    let body = async {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        op = op,
                        attempt = attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    };
    with_deadline(policy, op, body).await
}

/// Poll `f` until it yields `Some`, treating `None` and transient errors as
/// "not yet". Exhaustion is [`AdapterError::Timeout`].
pub async fn poll_until<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    mut f: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, AdapterError>>,
{
    let attempts = policy.attempts();
    let body = async {
        for attempt in 1..=attempts {
            match f().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    debug!(op = op, attempt = attempt, "Not ready yet");
                }
                Err(e) if e.is_transient() => {
                    warn!(op = op, attempt = attempt, error = %e, "Transient failure while polling");
                }
                Err(e) => return Err(e),
            }
            if attempt < attempts {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
        Err(AdapterError::Timeout {
            op: op.to_string(),
            attempts,
        })
    };
    with_deadline(policy, op, body).await
}

async fn with_deadline<T, Fut>(policy: &RetryPolicy, op: &str, body: Fut) -> Result<T, AdapterError>
where
    Fut: Future<Output = Result<T, AdapterError>>,
{
    match policy.timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), body)
            .await
            .unwrap_or_else(|_| {
                Err(AdapterError::Timeout {
                    op: op.to_string(),
                    attempts: policy.attempts(),
                })
            }),
        None => body.await,
    }
}
