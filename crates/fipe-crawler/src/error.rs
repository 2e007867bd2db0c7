//! Crate error type.

use std::time::Duration;

/// All errors that can end a crawl or fail a store call.
#[derive(thiserror::Error, Debug)]
pub enum CrawlError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store unavailable after {attempts} attempt(s): {source}")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fault budget exhausted at {path} after {faults} consecutive fault(s)")]
    FaultBudgetExhausted { path: String, faults: u32 },

    #[error("automation session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("{0} nodes anchor recorded history and are never deleted")]
    NotDeletable(crate::hierarchy::Level),

    #[error("crawl interrupted")]
    Interrupted,

    #[error("invalid {0}")]
    InvalidLabel(String),

    #[error("fixture error: {0}")]
    Fixture(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CrawlError>;

/// Fixed-delay retry policy shared by the store and the recovery controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// Maximum attempts; `0` retries forever.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_bounded() {
        let policy = RetryPolicy::new(Duration::ZERO, 3);
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn test_retry_policy_unbounded() {
        let policy = RetryPolicy::new(Duration::ZERO, 0);
        assert!(policy.allows(u32::MAX - 1));
    }

    #[test]
    fn test_error_display() {
        let err = CrawlError::FaultBudgetExhausted {
            path: "janeiro/2020 > Acme".to_string(),
            faults: 4,
        };
        assert_eq!(
            err.to_string(),
            "fault budget exhausted at janeiro/2020 > Acme after 4 consecutive fault(s)"
        );
    }
}
