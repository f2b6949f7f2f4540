//! Step failure handling: retry with exponential backoff, continue or abort

use crate::block::ActionError;
use crate::config::{ErrorHandlingOptions, RetryConfig};
use std::time::Duration;

/// Retry policy for steps with `retryOnFailure`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create a policy from engine config
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay),
            max_delay: Duration::from_millis(config.max_delay),
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            // Up to 25% extra
            let jitter = rand::random::<f64>() * 0.25 * capped_delay;
            capped_delay + jitter
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// What to do after a step attempt failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureVerdict {
    /// Fail the step and stop the run
    Abort,
    /// Record the failure and carry on with the next step
    Continue,
    /// Wait, then invoke the action again
    Retry(Duration),
}

/// Decides the fate of a failed step from its error handling options
#[derive(Debug, Clone, Default)]
pub struct FailurePolicy {
    retry: RetryPolicy,
}

impl FailurePolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// `attempt` is zero for the first failure
    ///
    /// Retries are exhausted before `continueOnFailure` is considered.
    pub fn handle(
        &self,
        options: &ErrorHandlingOptions,
        error: &ActionError,
        attempt: u32,
    ) -> FailureVerdict {
        if options.retry_on_failure() && error.is_retryable() && attempt < self.retry.max_retries
        {
            return FailureVerdict::Retry(self.retry.delay_for_attempt(attempt));
        }

        if options.continue_on_failure() {
            FailureVerdict::Continue
        } else {
            FailureVerdict::Abort
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Toggle;

    fn options(continue_on_failure: bool, retry_on_failure: bool) -> ErrorHandlingOptions {
        ErrorHandlingOptions {
            continue_on_failure: Some(Toggle::enabled(continue_on_failure)),
            retry_on_failure: Some(Toggle::enabled(retry_on_failure)),
        }
    }

    fn fixed_policy(max_retries: u32) -> FailurePolicy {
        FailurePolicy::new(RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(10),
            jitter: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_policy_with_jitter() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            jitter: true,
            ..Default::default()
        };

        let delay = policy.delay_for_attempt(0);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn test_policy_from_default_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_abort_without_options() {
        let policy = fixed_policy(3);
        let verdict = policy.handle(
            &ErrorHandlingOptions::default(),
            &ActionError::failed("boom"),
            0,
        );
        assert_eq!(verdict, FailureVerdict::Abort);
    }

    #[test]
    fn test_continue_on_failure() {
        let policy = fixed_policy(3);
        let verdict = policy.handle(&options(true, false), &ActionError::failed("boom"), 0);
        assert_eq!(verdict, FailureVerdict::Continue);
    }

    #[test]
    fn test_retry_until_exhausted() {
        let policy = fixed_policy(2);
        let opts = options(true, true);
        let err = ActionError::failed("flaky");

        assert_eq!(
            policy.handle(&opts, &err, 0),
            FailureVerdict::Retry(Duration::from_millis(10))
        );
        assert_eq!(
            policy.handle(&opts, &err, 1),
            FailureVerdict::Retry(Duration::from_millis(20))
        );
        assert_eq!(policy.handle(&opts, &err, 2), FailureVerdict::Continue);
    }

    #[test]
    fn test_invalid_input_not_retried() {
        let policy = fixed_policy(3);
        let verdict = policy.handle(
            &options(false, true),
            &ActionError::invalid_input("bad template"),
            0,
        );
        assert_eq!(verdict, FailureVerdict::Abort);
    }
}
