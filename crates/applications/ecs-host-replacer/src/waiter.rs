//! Condition polling for eventually-consistent control plane state
//!
//! ECS and Auto Scaling changes (a new instance registering, tasks draining)
//! have no fixed completion time. [`ConditionWaiter`] keeps probing until the
//! probe says the condition holds.
//!
//! ## Retry Semantics
//!
//! - An `Err` from the probe is logged and treated as "not yet"
//! - The default [`RetryPolicy`] is unbounded: the wait only ends when the
//!   condition is satisfied
//! - A bounded policy turns exhaustion into [`OrchestratorError::WaitExhausted`]

use crate::error::{OrchestratorError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default delay between polls (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Answer from a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Condition does not hold yet, with an optional human-readable reason
    Pending(Option<String>),
    /// Condition holds
    Satisfied,
}

impl PollOutcome {
    /// Not yet, with a reason
    pub fn pending(reason: impl Into<String>) -> Self {
        Self::Pending(Some(reason.into()))
    }
}

/// Shape of the delay between polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time
    Fixed,
    /// Delay multiplied by `factor` after each poll, capped at `max_delay`
    Exponential {
        /// Growth factor per attempt
        factor: u32,
        /// Upper bound on a single delay
        max_delay: Duration,
    },
}

/// How long and how often to keep polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay between polls
    pub interval: Duration,

    /// Stop after this many polls (`None` polls forever)
    pub max_attempts: Option<u32>,

    /// Delay growth
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS))
    }
}

impl RetryPolicy {
    /// Poll forever at a fixed interval
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            backoff: Backoff::Fixed,
        }
    }

    /// Give up after `attempts` polls
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Grow the delay exponentially up to `max_delay`
    pub fn with_exponential_backoff(mut self, factor: u32, max_delay: Duration) -> Self {
        self.backoff = Backoff::Exponential { factor, max_delay };
        self
    }

    /// Delay to sleep before poll number `attempt` (1-indexed, attempt > 1)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { factor, max_delay } => {
                let exponent = attempt.saturating_sub(2);
                let multiplier = factor.max(1).checked_pow(exponent).unwrap_or(u32::MAX);
                self.interval
                    .checked_mul(multiplier)
                    .unwrap_or(max_delay)
                    .min(max_delay)
            }
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Summary of a finished wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReport {
    /// Number of probe invocations, including the satisfied one
    pub attempts: u32,

    /// Time spent waiting
    pub elapsed: Duration,
}

/// Polls a probe until it reports [`PollOutcome::Satisfied`]
#[derive(Debug, Clone, Default)]
pub struct ConditionWaiter {
    policy: RetryPolicy,
}

impl ConditionWaiter {
    /// Create a waiter with the given retry policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Get the retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wait until `poll` reports the condition holds
    ///
    /// # Arguments
    /// - `condition`: description used in log lines
    /// - `wait_before_first_poll`: sleep one interval before the first probe
    /// - `poll`: the probe; errors count as "not yet"
    pub async fn wait_until<F, Fut>(
        &self,
        condition: &str,
        wait_before_first_poll: bool,
        mut poll: F,
    ) -> Result<WaitReport>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollOutcome>>,
    {
        let start = Instant::now();
        let mut attempts: u32 = 0;

        info!(condition = %condition, "Waiting for condition");

        loop {
            if attempts > 0 || wait_before_first_poll {
                let delay = if attempts == 0 {
                    self.policy.interval
                } else {
                    self.policy.delay_before(attempts + 1)
                };
                info!("Waiting {}s...", delay.as_secs());
                tokio::time::sleep(delay).await;
            }

            attempts += 1;

            match poll().await {
                Ok(PollOutcome::Satisfied) => {
                    let elapsed = start.elapsed();
                    info!(
                        condition = %condition,
                        attempts,
                        elapsed_secs = elapsed.as_secs_f64(),
                        "Condition satisfied"
                    );
                    return Ok(WaitReport { attempts, elapsed });
                }
                Ok(PollOutcome::Pending(Some(reason))) => {
                    info!(attempt = attempts, "{}", reason);
                }
                Ok(PollOutcome::Pending(None)) => {
                    debug!(attempt = attempts, condition = %condition, "Condition not yet met");
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Error while polling, will retry");
                }
            }

            if self.policy.exhausted(attempts) {
                warn!(condition = %condition, attempts, "Giving up on condition");
                return Err(OrchestratorError::WaitExhausted {
                    condition: condition.to_string(),
                    attempts,
                });
            }
        }
    }
}
