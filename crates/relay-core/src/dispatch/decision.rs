//! Decision model: what the execution loop does after a failed attempt.

use std::time::Duration;

use super::retry::RetryPolicy;
use crate::domain::ModelError;

/// The next step after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Wait `delay`, then run another attempt.
    Retry { delay: Duration, reason: String },

    /// Stop and finalize the task as failed.
    GiveUp { reason: String },
}

/// Decides the next step from the attempt count and the error.
///
/// Deciders are pure: the execution loop applies the decision.
pub trait Decider: Send + Sync {
    /// `attempts` is the number of attempts already executed (1-based).
    fn decide(&self, attempts: u32, error: &ModelError) -> Decision;
}

/// Retries transient errors until the attempt budget runs out.
#[derive(Debug, Clone)]
pub struct RetryDecider {
    policy: RetryPolicy,
}

impl RetryDecider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Decider for RetryDecider {
    fn decide(&self, attempts: u32, error: &ModelError) -> Decision {
        if !error.is_retryable() {
            return Decision::GiveUp {
                reason: format!("non-retryable error: {error}"),
            };
        }
        if attempts >= self.policy.max_attempts {
            return Decision::GiveUp {
                reason: format!(
                    "max attempts reached: {attempts}/{}",
                    self.policy.max_attempts
                ),
            };
        }
        let delay = self.policy.next_delay(attempts);
        Decision::Retry {
            delay,
            reason: format!(
                "retry attempt {}/{} after {:?}",
                attempts + 1,
                self.policy.max_attempts,
                delay
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decider() -> RetryDecider {
        RetryDecider::new(RetryPolicy::new(2, Duration::from_millis(100)))
    }

    #[test]
    fn transient_error_retries_within_budget() {
        let decision = decider().decide(1, &ModelError::Timeout { timeout_ms: 50 });
        assert!(matches!(
            decision,
            Decision::Retry { delay, .. } if delay == Duration::from_millis(100)
        ));
    }

    #[rstest]
    #[case::budget_exhausted(2, ModelError::Transient("reset".into()))]
    #[case::non_retryable(1, ModelError::NonRetryable("bad request".into()))]
    #[case::aborted(1, ModelError::Aborted)]
    fn gives_up(#[case] attempts: u32, #[case] error: ModelError) {
        assert!(matches!(
            decider().decide(attempts, &error),
            Decision::GiveUp { .. }
        ));
    }
}
