use std::time::Duration;

use crate::core::classify::{FetchResult, StatusClass};
use crate::core::retry::{PageRetryState, RetryPolicy, RetryReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Page succeeded; emit its items and advance.
    Consume,
    /// Empty page; the category is finished.
    EndCategory,
    /// Rate limited: wait, optionally refresh cookies, retry the same page.
    Backoff {
        delay: Duration,
        refresh_cookies: bool,
    },
    RotateProxy,
    RotateIdentity { pause: Duration },
    RebuildSession,
    /// Transient failure: wait and retry the same page.
    Retry { delay: Duration },
    /// Unusable payload; end the category without retrying. The session is
    /// not suspected.
    Abandon(String),
    /// Give up on the category.
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Normal,
    RateLimited,
    Blocked,
    Unauthorized,
    Fatal,
}

/// Bounded recovery for a single page. Every non-terminal transition spends
/// one unit of the page budget; `Fatal` is sticky.
#[derive(Debug, Clone)]
pub struct RecoveryMachine {
    policy: RetryPolicy,
    state: MachineState,
    budget_used: usize,
    retries: PageRetryState,
}

impl RecoveryMachine {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            policy: policy.clone(),
            state: MachineState::Normal,
            budget_used: 0,
            retries: PageRetryState::new(),
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn budget_used(&self) -> usize {
        self.budget_used
    }

    pub fn next(&mut self, result: &FetchResult) -> RecoveryAction {
        if self.state == MachineState::Fatal {
            return RecoveryAction::Fatal("page already abandoned".to_string());
        }

        match result.status_class {
            StatusClass::Ok => {
                self.state = MachineState::Normal;
                return RecoveryAction::Consume;
            }
            StatusClass::Empty => {
                self.state = MachineState::Normal;
                return RecoveryAction::EndCategory;
            }
            StatusClass::Malformed => {
                self.state = MachineState::Normal;
                return RecoveryAction::Abandon(format!("malformed response: {}", result.detail));
            }
            _ => {}
        }

        if self.budget_used >= self.policy.page_budget {
            return self.fatal(format!(
                "retry budget of {} spent, last failure: {}",
                self.policy.page_budget, result.detail
            ));
        }

        let action = match result.status_class {
            StatusClass::RateLimited => {
                self.state = MachineState::RateLimited;
                let attempt = self.retries.record(RetryReason::RateLimit);
                let backoff = self.policy.rate_limit.calculate_delay(attempt);
                RecoveryAction::Backoff {
                    delay: backoff.max(result.retry_after.unwrap_or(Duration::ZERO)),
                    refresh_cookies: true,
                }
            }
            StatusClass::Blocked => {
                self.state = MachineState::Blocked;
                match self.retries.record(RetryReason::Blocked) {
                    0 => RecoveryAction::RotateProxy,
                    1 => RecoveryAction::RotateIdentity {
                        pause: self.policy.identity_pause.sample()
                            + self.policy.jitter_pause.sample(),
                    },
                    2 => RecoveryAction::RebuildSession,
                    _ => return self.fatal("still blocked after session rebuild".to_string()),
                }
            }
            StatusClass::Unauthorized => {
                self.state = MachineState::Unauthorized;
                match self.retries.record(RetryReason::Unauthorized) {
                    0 => RecoveryAction::RebuildSession,
                    _ => return self.fatal("still unauthorized after session rebuild".to_string()),
                }
            }
            _ => {
                let attempt = self.retries.record(RetryReason::Transient);
                RecoveryAction::Retry {
                    delay: self.policy.transient.calculate_delay(attempt),
                }
            }
        };
        self.budget_used += 1;
        action
    }

    fn fatal(&mut self, reason: String) -> RecoveryAction {
        self.state = MachineState::Fatal;
        RecoveryAction::Fatal(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::{BackoffConfig, BackoffPolicy};

    fn result(class: StatusClass) -> FetchResult {
        FetchResult {
            status_class: class,
            items: Vec::new(),
            raw_status: None,
            retry_after: None,
            detail: String::new(),
        }
    }

    #[test]
    fn test_block_ladder_then_fatal() {
        let mut machine = RecoveryMachine::new(&RetryPolicy::immediate());
        let blocked = result(StatusClass::Blocked);

        assert_eq!(machine.next(&blocked), RecoveryAction::RotateProxy);
        assert!(matches!(machine.next(&blocked), RecoveryAction::RotateIdentity { .. }));
        assert_eq!(machine.next(&blocked), RecoveryAction::RebuildSession);
        assert!(matches!(machine.next(&blocked), RecoveryAction::Fatal(_)));
        assert_eq!(machine.state(), MachineState::Fatal);
        assert!(matches!(machine.next(&result(StatusClass::Ok)), RecoveryAction::Fatal(_)));
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let policy = RetryPolicy::default().with_rate_limit(BackoffConfig::new(
            Duration::from_secs(1),
            Duration::from_secs(8),
            BackoffPolicy::Exponential { factor: 2.0 },
        ));
        let mut machine = RecoveryMachine::new(&policy);

        let mut limited = result(StatusClass::RateLimited);
        limited.retry_after = Some(Duration::from_secs(5));
        assert_eq!(
            machine.next(&limited),
            RecoveryAction::Backoff {
                delay: Duration::from_secs(5),
                refresh_cookies: true
            }
        );

        limited.retry_after = None;
        assert_eq!(
            machine.next(&limited),
            RecoveryAction::Backoff {
                delay: Duration::from_secs(2),
                refresh_cookies: true
            }
        );
        assert_eq!(machine.next(&result(StatusClass::Ok)), RecoveryAction::Consume);
        assert_eq!(machine.state(), MachineState::Normal);
    }

    #[test]
    fn test_unauthorized_rebuilds_once() {
        let mut machine = RecoveryMachine::new(&RetryPolicy::immediate());
        let unauthorized = result(StatusClass::Unauthorized);
        assert_eq!(machine.next(&unauthorized), RecoveryAction::RebuildSession);
        assert!(matches!(machine.next(&unauthorized), RecoveryAction::Fatal(_)));
    }

    #[test]
    fn test_budget_is_shared_across_reasons() {
        let mut machine = RecoveryMachine::new(&RetryPolicy::immediate());
        assert!(matches!(
            machine.next(&result(StatusClass::TransientError)),
            RecoveryAction::Retry { .. }
        ));
        assert!(matches!(
            machine.next(&result(StatusClass::RateLimited)),
            RecoveryAction::Backoff { .. }
        ));
        assert_eq!(machine.next(&result(StatusClass::Blocked)), RecoveryAction::RotateProxy);
        assert_eq!(machine.budget_used(), 3);
        assert!(matches!(
            machine.next(&result(StatusClass::TransientError)),
            RecoveryAction::Fatal(_)
        ));
    }

    #[test]
    fn test_terminal_classes() {
        let mut machine = RecoveryMachine::new(&RetryPolicy::immediate());
        assert_eq!(machine.next(&result(StatusClass::Empty)), RecoveryAction::EndCategory);
        assert!(matches!(
            machine.next(&result(StatusClass::Malformed)),
            RecoveryAction::Abandon(_)
        ));
        assert_eq!(machine.state(), MachineState::Normal);
        assert_eq!(machine.budget_used(), 0);
    }
}
