use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const NORMAL_CLOSURE: u16 = 1000;
/// Closed without a status code
pub const NO_STATUS: u16 = 1005;
/// Dropped without a close frame; also used for transport errors and failed connects
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseDecision {
    /// Normal or user-initiated close
    Quiet,
    Retry { attempt: u32, delay: Duration },
    /// Abnormal close with no attempts left
    GiveUp { attempts: u32 },
    /// Any other close code: reported, not retried
    Report { code: u16 },
}

impl ReconnectPolicy {
    /// Delay before the `attempt`-th retry (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self
            .base_delay_ms
            .saturating_mul(attempt as u64)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn is_retryable(code: u16) -> bool {
        matches!(code, NO_STATUS | ABNORMAL_CLOSURE)
    }

    /// What to do after a close, given the retries already made since the last successful open
    pub fn decide(&self, code: u16, attempts_made: u32, user_initiated: bool) -> CloseDecision {
        if user_initiated || code == NORMAL_CLOSURE {
            return CloseDecision::Quiet;
        }
        if !Self::is_retryable(code) {
            return CloseDecision::Report { code };
        }
        if attempts_made >= self.max_attempts {
            return CloseDecision::GiveUp { attempts: attempts_made };
        }
        let attempt = attempts_made + 1;
        CloseDecision::Retry {
            attempt,
            delay: self.delay_for(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|n| policy.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 3000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_three_abnormal_closes_then_give_up() {
        let policy = ReconnectPolicy::default();
        let mut attempts = 0;
        for expected in 1..=3 {
            match policy.decide(ABNORMAL_CLOSURE, attempts, false) {
                CloseDecision::Retry { attempt, delay } => {
                    assert_eq!(attempt, expected);
                    assert_eq!(delay, Duration::from_secs(expected as u64));
                    attempts = attempt;
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }
        assert_eq!(
            policy.decide(ABNORMAL_CLOSURE, attempts, false),
            CloseDecision::GiveUp { attempts: 3 }
        );
    }

    #[test]
    fn test_no_status_is_retryable() {
        let policy = ReconnectPolicy::default();
        assert!(matches!(
            policy.decide(NO_STATUS, 0, false),
            CloseDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_user_disconnect_and_normal_close_are_quiet() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.decide(ABNORMAL_CLOSURE, 0, true), CloseDecision::Quiet);
        assert_eq!(policy.decide(NORMAL_CLOSURE, 0, false), CloseDecision::Quiet);
    }

    #[test]
    fn test_other_codes_reported() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.decide(1008, 0, false), CloseDecision::Report { code: 1008 });
        assert_eq!(policy.decide(4001, 2, false), CloseDecision::Report { code: 4001 });
    }
}
