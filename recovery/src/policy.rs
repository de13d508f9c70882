//! Retry policy and backoff schedule
//!
//! Delay before retry `n` (0-indexed) is `min(base × multiplier^n, max)`,
//! optionally spread by ±`jitter_factor`.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;

use crate::classifier::ErrorClassification;
use crate::error::{RecoveryError, Result};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Immutable retry policy. Build one with [`RetryPolicy::builder`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter_factor: f64,
    retryable: BTreeSet<ErrorClassification>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: 0.0,
            retryable: default_retryable(),
        }
    }
}

fn default_retryable() -> BTreeSet<ErrorClassification> {
    ErrorClassification::all()
        .iter()
        .copied()
        .filter(|class| class.is_retryable_by_default())
        .collect()
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    pub fn retryable(&self) -> &BTreeSet<ErrorClassification> {
        &self.retryable
    }

    pub fn is_retryable(&self, class: ErrorClassification) -> bool {
        self.retryable.contains(&class)
    }

    /// Backoff before retry `attempt` without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let max_ms = self.max_delay.as_millis() as f64;
        let raw_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(raw_ms.min(max_ms).round() as u64)
    }

    /// Backoff before retry `attempt`, jitter applied and still capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for_attempt(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        apply_jitter(delay, self.jitter_factor).min(self.max_delay)
    }

    /// Un-jittered delays for every retry this policy allows.
    pub fn schedule(&self) -> Vec<Duration> {
        self.schedule_for(self.max_retries)
    }

    /// Un-jittered delays for the first `retries` retries, ignoring `max_retries`.
    pub fn schedule_for(&self, retries: u32) -> Vec<Duration> {
        (0..retries)
            .map(|attempt| self.base_delay_for_attempt(attempt))
            .collect()
    }
}

/// Builder that validates the policy invariants on [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.policy.jitter_factor = factor;
        self
    }

    /// Replaces the set of classifications that are retried.
    pub fn retryable<I>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = ErrorClassification>,
    {
        self.policy.retryable = classes.into_iter().collect();
        self
    }

    pub fn build(self) -> Result<RetryPolicy> {
        let policy = self.policy;
        // Delays are scheduled in whole milliseconds.
        if policy.base_delay < Duration::from_millis(1) {
            return Err(RecoveryError::InvalidPolicy(format!(
                "base delay must be at least 1ms, got {:?}",
                policy.base_delay
            )));
        }
        if policy.max_delay < policy.base_delay {
            return Err(RecoveryError::InvalidPolicy(format!(
                "max delay {:?} is shorter than base delay {:?}",
                policy.max_delay, policy.base_delay
            )));
        }
        if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier <= 1.0 {
            return Err(RecoveryError::InvalidPolicy(format!(
                "backoff multiplier must be greater than 1.0, got {}",
                policy.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&policy.jitter_factor) {
            return Err(RecoveryError::InvalidPolicy(format!(
                "jitter factor must be within 0.0..=1.0, got {}",
                policy.jitter_factor
            )));
        }
        Ok(policy)
    }
}

/// Adds random variation (±jitter_factor) to a duration.
/// Example: 100ms with 0.5 jitter → 50ms to 150ms
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    let jitter = rand::rng().random_range(-jitter_factor..=jitter_factor);
    let jittered_ms = (duration.as_millis() as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(jittered_ms)
}
