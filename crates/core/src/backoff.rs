//! Retry backoff policy and delay calculation.
//!
//! Pure functions: no clocks, no I/O. Randomness for jitter is injected so
//! tests can use a seeded generator.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default base delay between retries.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Default cap applied to exponential delays.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Exponential backoff: base * 2^attempt, capped at `max_delay_ms`.
    #[default]
    Exponential,
    /// Fixed delay between retries (never capped).
    Fixed,
}

/// Backoff policy value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Scale the delay by a uniform factor in [0.5, 1.5).
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Exponential policy with jitter enabled.
    pub fn exponential(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms,
            max_delay_ms,
            jitter: true,
        }
    }

    /// Fixed policy with jitter enabled.
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Delay in milliseconds before the retry following `attempt`, using the
/// thread-local random source for jitter.
pub fn compute_delay(attempt: u32, policy: &BackoffPolicy) -> u64 {
    compute_delay_with(attempt, policy, &mut rand::thread_rng())
}

/// Same as [`compute_delay`] with an explicit random source.
pub fn compute_delay_with<R: Rng + ?Sized>(attempt: u32, policy: &BackoffPolicy, rng: &mut R) -> u64 {
    let delay = match policy.kind {
        BackoffKind::Fixed => policy.base_delay_ms,
        BackoffKind::Exponential => {
            let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
            policy.base_delay_ms.saturating_mul(factor).min(policy.max_delay_ms)
        }
    };

    if !policy.jitter {
        return delay;
    }

    let factor: f64 = rng.gen_range(0.5..1.5);
    (delay as f64 * factor).round() as u64
}

/// Whether another try is allowed.
///
/// `attempts_made` counts completed tries (1-based), not retries remaining.
pub fn should_retry(attempts_made: u32, max_attempts: u32) -> bool {
    attempts_made < max_attempts
}

/// Delay the broker waits after the `attempts_made`-th failed try.
///
/// The first retry waits `compute_delay(0)`, i.e. the base delay.
pub fn retry_delay_after(attempts_made: u32, policy: &BackoffPolicy) -> u64 {
    compute_delay(attempts_made.saturating_sub(1), policy)
}
