mod types;
mod utils;

pub use types::{
    BackoffConfig, BackoffPolicy, ContentRetryCondition, PageRetryState, RetryPolicy, RetryReason,
};
pub use utils::{calculate_delay, check_content_condition, parse_retry_after};

use std::time::Duration;

use crate::core::config::DelayRange;

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_policy: BackoffPolicy::Exponential { factor: 2.0 },
        }
    }
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration, backoff_policy: BackoffPolicy) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_policy,
        }
    }

    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        calculate_delay(self, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            page_budget: 3,
            rate_limit: BackoffConfig::new(
                Duration::from_secs(60),
                Duration::from_secs(240),
                BackoffPolicy::Exponential { factor: 2.0 },
            ),
            transient: BackoffConfig::new(
                Duration::from_secs(1),
                Duration::from_secs(30),
                BackoffPolicy::Exponential { factor: 2.0 },
            ),
            identity_pause: DelayRange::from_secs(5, 10),
            jitter_pause: DelayRange::from_secs(10, 20),
            consecutive_failure_threshold: 3,
            max_session_failures: 5,
            block_conditions: vec![ContentRetryCondition {
                pattern: r"(?i)captcha|datadome|cf-chl|just a moment|access denied".to_string(),
                is_regex: true,
            }],
        }
    }
}

impl RetryPolicy {
    pub fn with_page_budget(mut self, budget: usize) -> Self {
        self.page_budget = budget;
        self
    }

    pub fn with_rate_limit(mut self, config: BackoffConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn with_transient(mut self, config: BackoffConfig) -> Self {
        self.transient = config;
        self
    }

    pub fn with_pauses(mut self, identity_pause: DelayRange, jitter_pause: DelayRange) -> Self {
        self.identity_pause = identity_pause;
        self.jitter_pause = jitter_pause;
        self
    }

    pub fn with_session_limits(mut self, consecutive_failures: usize, session_failures: usize) -> Self {
        self.consecutive_failure_threshold = consecutive_failures;
        self.max_session_failures = session_failures;
        self
    }

    /// No waiting at all; used by tests and dry runs.
    pub fn immediate() -> Self {
        let zero = BackoffConfig::new(Duration::ZERO, Duration::ZERO, BackoffPolicy::Constant);
        Self {
            rate_limit: zero.clone(),
            transient: zero,
            identity_pause: DelayRange::zero(),
            jitter_pause: DelayRange::zero(),
            ..Self::default()
        }
    }

    pub fn is_block_page(&self, body: &str) -> bool {
        self.block_conditions
            .iter()
            .any(|condition| check_content_condition(condition, body))
    }
}

impl PageRetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one retry for `reason` and returns how many came before it.
    pub fn record(&mut self, reason: RetryReason) -> usize {
        let previous = self.counts.get(&reason).copied().unwrap_or(0);
        self.counts.insert(reason, previous + 1);
        self.total_retries += 1;
        previous
    }

    pub fn count(&self, reason: RetryReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }
}
