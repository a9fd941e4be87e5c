use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::core::config::DelayRange;

#[derive(Debug, Clone)]
pub struct ContentRetryCondition {
    pub pattern: String,
    pub is_regex: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum BackoffPolicy {
    Constant,
    Linear,
    Exponential { factor: f32 },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
pub enum RetryReason {
    RateLimit,    // 429
    Blocked,      // 403, challenge pages
    Unauthorized, // 401
    Transient,    // timeouts, resets, other statuses
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_policy: BackoffPolicy,
}

/// Bounds and pacing for the block-response state machine.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Recovery transitions allowed per page before the category is abandoned.
    pub page_budget: usize,
    pub rate_limit: BackoffConfig,
    pub transient: BackoffConfig,
    /// Pause applied together with an identity rotation.
    pub identity_pause: DelayRange,
    /// Extra randomized pause added on the identity-rotation step.
    pub jitter_pause: DelayRange,
    /// Consecutive failed pages that trigger a session rebuild.
    pub consecutive_failure_threshold: usize,
    /// Session rebuilds tolerated before the run is aborted.
    pub max_session_failures: usize,
    /// Body patterns that mark a 200 response as a block/challenge page.
    pub block_conditions: Vec<ContentRetryCondition>,
}

#[derive(Debug, Clone, Default)]
pub struct PageRetryState {
    pub counts: HashMap<RetryReason, usize>,
    pub total_retries: usize,
}
