//! Retry policy and the per-delivery state machine.
//!
//! ```text
//! Pending{1} ──send──► Delivered
//!     │
//!     └─failure─► Backoff{2, delay} ──elapsed──► Pending{2} ──send──► ...
//!                                                     │
//!                        attempt == max_attempts ─────┴─failure─► Exhausted
//! ```
//!
//! `Delivered` and `Exhausted` are terminal. Attempts of one delivery never overlap: the next
//! `Pending` state only exists once the previous outcome is known.

use std::time::Duration;

use rand::Rng;

use crate::config::WebhookConfig;

/// How many attempts a delivery gets and how long to wait between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.backoff.initial_delay,
            multiplier: config.backoff.multiplier,
            max_delay: config.backoff.max_delay,
            jitter: config.backoff.jitter,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry `retry` (1-based) without jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // powi overflows to infinity, which the cap absorbs
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before retry `retry` (1-based), spread by the configured jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeliveryState {
    /// Attempt `attempt` (1-based) is due
    Pending { attempt: u32 },
    /// The last attempt failed; attempt `next_attempt` is due after `delay`
    Backoff { next_attempt: u32, delay: Duration },
    /// Acknowledged with a 2xx
    Delivered { attempts: u32 },
    /// Every attempt failed
    Exhausted { attempts: u32 },
}

impl DeliveryState {
    pub fn start() -> Self {
        Self::Pending { attempt: 1 }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::Exhausted { .. })
    }

    /// Transition once the outcome of the pending attempt is known.
    pub fn on_outcome(self, success: bool, policy: &RetryPolicy) -> Self {
        match self {
            Self::Pending { attempt } if success => Self::Delivered { attempts: attempt },
            Self::Pending { attempt } if attempt >= policy.max_attempts() => Self::Exhausted { attempts: attempt },
            Self::Pending { attempt } => Self::Backoff {
                next_attempt: attempt + 1,
                delay: policy.delay(attempt),
            },
            other => other,
        }
    }

    /// Transition once the backoff delay has passed.
    pub fn on_backoff_elapsed(self) -> Self {
        match self {
            Self::Backoff { next_attempt, .. } => Self::Pending { attempt: next_attempt },
            other => other,
        }
    }
}
