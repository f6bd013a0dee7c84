//! Bounded exponential backoff with jitter.
//!
//! Used by the watchdog between resubscribe attempts, by the sync engine
//! while the local store is unavailable, and by the outboxes while the
//! remote store rejects writes.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};
use crate::shutdown::ShutdownSignal;
use crate::storage::StoreError;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(rename = "base_ms", with = "crate::config::duration_ms")]
    pub base: Duration,
    /// Upper bound for any single delay.
    #[serde(rename = "cap_ms", with = "crate::config::duration_ms")]
    pub cap: Duration,
    /// Fraction of the delay that is randomized away, in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy without jitter.
    #[must_use]
    pub const fn fixed_ratio(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: 0.0,
        }
    }

    /// Returns the same policy with a different jitter fraction.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay for the given zero-based attempt.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Jittered delay for the given zero-based attempt. Never exceeds the cap.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 || ceiling.is_zero() {
            return ceiling;
        }
        let cut: f64 = rand::thread_rng().gen_range(0.0..=jitter);
        ceiling.mul_f64(1.0 - cut)
    }
}

/// Stateful attempt counter over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Creates a fresh counter.
    #[must_use]
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Returns the next delay and advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Starts over from the base delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Runs a store operation, retrying `StoreUnavailable` with backoff.
///
/// Other store errors are returned immediately. After `max_attempts`
/// failed attempts the error becomes `FatalStoreFailure`.
pub fn retry_store<T>(
    policy: BackoffPolicy,
    max_attempts: u32,
    shutdown: &ShutdownSignal,
    operation: &str,
    mut f: impl FnMut() -> Result<T, StoreError>,
) -> GatewayResult<T> {
    let max_attempts = max_attempts.max(1);
    let mut backoff = Backoff::new(policy);
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_unavailable() => {
                let attempts = backoff.attempts() + 1;
                if attempts >= max_attempts {
                    return Err(GatewayError::FatalStoreFailure {
                        attempts,
                        message: err.to_string(),
                    });
                }
                let delay = backoff.next_delay();
                warn!(operation, attempt = attempts, delay_ms = delay.as_millis() as u64, error = %err, "store unavailable, retrying");
                if shutdown.wait_timeout(delay) {
                    return Err(GatewayError::Shutdown);
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}
