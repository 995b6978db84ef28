//! Retry and limit policies applied by the orchestration engine.
//!
//! Limits bound a single conversation:
//! - Number of objectives walked
//! - Wall-clock duration

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-conversation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLimits {
    /// Maximum objectives walked per conversation (default: 100)
    #[serde(default = "default_max_objectives")]
    pub max_objectives: u32,

    /// Total conversation timeout in seconds (default: 1800 = 30 min)
    #[serde(default = "default_conversation_timeout")]
    pub conversation_timeout_seconds: u64,
}

fn default_max_objectives() -> u32 {
    100
}
fn default_conversation_timeout() -> u64 {
    1800
} // 30 min

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_objectives: default_max_objectives(),
            conversation_timeout_seconds: default_conversation_timeout(),
        }
    }
}

impl EngineLimits {
    /// Check current tracker state against limits
    pub fn check(&self, tracker: &LimitTracker) -> Result<(), LimitViolation> {
        if tracker.objectives_walked >= self.max_objectives {
            return Err(LimitViolation::MaxObjectives {
                actual: tracker.objectives_walked,
                limit: self.max_objectives,
            });
        }

        let elapsed = tracker.started_at.elapsed().as_secs();
        if elapsed >= self.conversation_timeout_seconds {
            return Err(LimitViolation::ConversationTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.conversation_timeout_seconds,
            });
        }

        Ok(())
    }
}

/// Tracks resource usage during a conversation
#[derive(Debug, Clone)]
pub struct LimitTracker {
    pub objectives_walked: u32,

    pub started_at: Instant,
}

impl Default for LimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LimitTracker {
    pub fn new() -> Self {
        Self {
            objectives_walked: 0,
            started_at: Instant::now(),
        }
    }

    pub fn record_objective(&mut self) {
        self.objectives_walked += 1;
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Limit violations end a conversation as failed
#[derive(Debug, Clone, Error)]
pub enum LimitViolation {
    #[error("Maximum objectives exceeded: {actual} >= {limit}")]
    MaxObjectives { actual: u32, limit: u32 },

    #[error("Conversation timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    ConversationTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}

impl LimitViolation {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MaxObjectives { .. } => "MAX_OBJECTIVES_EXCEEDED",
            Self::ConversationTimeout { .. } => "CONVERSATION_TIMEOUT",
        }
    }
}

/// Backoff between attempts at the same objective.
///
/// How many attempts are made is decided by the objective's `max_retries`;
/// this only spaces them out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    10000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay before a retry (1-indexed: 1 is the first retry)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((retry - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = EngineLimits::default();
        assert_eq!(limits.max_objectives, 100);
        assert_eq!(limits.conversation_timeout_seconds, 1800);
    }

    #[test]
    fn test_tracker_objective_counting() {
        let limits = EngineLimits {
            max_objectives: 2,
            ..Default::default()
        };

        let mut tracker = LimitTracker::new();
        assert!(limits.check(&tracker).is_ok());

        tracker.record_objective();
        assert!(limits.check(&tracker).is_ok());

        tracker.record_objective();
        let result = limits.check(&tracker);
        assert!(matches!(result, Err(LimitViolation::MaxObjectives { .. })));
        assert_eq!(result.unwrap_err().code(), "MAX_OBJECTIVES_EXCEEDED");
    }

    #[test]
    fn test_zero_timeout_trips_immediately() {
        let limits = EngineLimits {
            conversation_timeout_seconds: 0,
            ..Default::default()
        };
        let result = limits.check(&LimitTracker::new());
        assert!(matches!(
            result,
            Err(LimitViolation::ConversationTimeout { .. })
        ));
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
        };

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_retry(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.delay_for_retry(1), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(7), Duration::ZERO);
    }
}
