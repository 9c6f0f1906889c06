//! Retry and polling primitives shared by the convergence loops.
//!
//! Retry policy is kept apart from the calls being retried: loops count
//! failures and ask [`should_retry`], compute their pause through a
//! [`Backoff`], and sleep through a [`Deadline`] so the caller can cancel
//! or bound the whole operation.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Interrupted;

/// Whether another attempt is allowed after `attempt` failures.
pub fn should_retry(attempt: u32, budget: u32) -> bool {
    attempt < budget
}

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first retry, in milliseconds.
    pub initial_ms: u64,
    /// Upper bound for a single delay, in milliseconds.
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay to randomize, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl Backoff {
    /// Constant cadence, used by polling loops.
    pub fn fixed(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            initial_ms: ms,
            max_ms: ms,
            multiplier: 1.0,
            jitter: 0.1,
        }
    }

    /// Doubling delays capped at `max`, used by error retries.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay for the `attempt`-th wait (1-based) before jitter is applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_ms.max(self.initial_ms) as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for the `attempt`-th wait with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }
}

/// A "poll until confirmed" wait with an optional overall limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    pub interval: Backoff,
    /// Give up after this many seconds. `None` waits until confirmed.
    pub timeout_secs: Option<u64>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Backoff::fixed(Duration::from_secs(5)),
            timeout_secs: Some(600),
        }
    }
}

impl WaitPolicy {
    pub fn new(interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            interval: Backoff::fixed(interval),
            timeout_secs: timeout.map(|t| t.as_secs()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Cancellation signal plus optional wall-clock limit for one operation.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    token: CancellationToken,
    at: Option<Instant>,
}

impl Deadline {
    /// No limit and a fresh, never-cancelled token.
    pub fn none() -> Self {
        Self::default()
    }

    /// Expires `limit` from now. A limit past the clock's range means no limit.
    pub fn after(limit: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            at: Instant::now().checked_add(limit),
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// A deadline sharing this token, expiring at the earlier of both limits.
    pub fn narrowed(&self, limit: Option<Duration>) -> Self {
        let at = match (self.at, limit.and_then(|l| Instant::now().checked_add(l))) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            token: self.token.clone(),
            at,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        if let Some(at) = self.at
            && Instant::now() >= at
        {
            return Err(Interrupted::DeadlineExceeded);
        }
        Ok(())
    }

    /// Sleep for `duration` unless cancelled or the deadline passes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.check()?;
        let wake = Instant::now().checked_add(duration);
        match (self.at, wake) {
            (Some(at), None) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(Interrupted::Cancelled),
                    _ = tokio::time::sleep_until(at) => Err(Interrupted::DeadlineExceeded),
                }
            }
            (Some(at), Some(wake)) if at < wake => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(Interrupted::Cancelled),
                    _ = tokio::time::sleep_until(at) => Err(Interrupted::DeadlineExceeded),
                }
            }
            (_, Some(wake)) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(Interrupted::Cancelled),
                    _ = tokio::time::sleep_until(wake) => Ok(()),
                }
            }
            (None, None) => {
                self.token.cancelled().await;
                Err(Interrupted::Cancelled)
            }
        }
    }
}
