//! Error taxonomy shared by the admission queue, the connection pool and the
//! backend adapters.
//!
//! Retries at the queue and pool layers are driven entirely by
//! [`TaskError::is_retryable`]; by the time an error reaches the pipeline it
//! has already exhausted every retry it was entitled to.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// Outcome of a failed unit of work (queued task or pooled request).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// A bounded queue or the pool's global ceiling is full.  Never retried.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The work did not finish within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Transport or HTTP status failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Same as [`TaskError::Backend`] but known to be permanent (4xx).
    #[error("backend rejected the request: {0}")]
    Rejected(String),

    /// The backend answered but no usable text could be extracted.
    #[error("failed to parse backend response: {0}")]
    Parse(String),

    /// The backend answered with no usable content.
    #[error("backend returned an empty response")]
    EmptyResponse,

    /// A streaming response broke after part of it was already consumed.
    /// Replaying it would duplicate output, so it is not retried.
    #[error("stream interrupted after partial output: {0}")]
    Interrupted(String),

    /// The caller cancelled the work.  Not a failure; no retry.
    #[error("cancelled")]
    Cancelled,

    /// Unexpected internal condition (join failure, closed channel).
    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Whether the queue/pool retry loop may try this work again.
    ///
    /// ```
    /// use std::time::Duration;
    /// use voice_relay::TaskError;
    ///
    /// assert!(TaskError::Timeout(Duration::from_secs(1)).is_retryable());
    /// assert!(TaskError::Backend("503".into()).is_retryable());
    /// assert!(!TaskError::CapacityExceeded("full".into()).is_retryable());
    /// assert!(!TaskError::Cancelled.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Timeout(_) | TaskError::Backend(_))
    }

    /// `true` for [`TaskError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TaskError::Timeout(Duration::ZERO)
        } else if e.is_decode() {
            TaskError::Parse(e.to_string())
        } else {
            TaskError::Backend(e.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for TaskError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            TaskError::Cancelled
        } else {
            TaskError::Internal(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeout_and_backend_are_retryable() {
        let cases = [
            (TaskError::CapacityExceeded("q".into()), false),
            (TaskError::Timeout(Duration::from_millis(5)), true),
            (TaskError::Backend("boom".into()), true),
            (TaskError::Rejected("400".into()), false),
            (TaskError::Parse("bad".into()), false),
            (TaskError::EmptyResponse, false),
            (TaskError::Interrupted("eof".into()), false),
            (TaskError::Cancelled, false),
            (TaskError::Internal("x".into()), false),
        ];
        for (err, expected) in cases {
            assert_eq!(err.is_retryable(), expected, "{err}");
        }
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(
            TaskError::CapacityExceeded("synthesis queue full (200)".into()).to_string(),
            "capacity exceeded: synthesis queue full (200)"
        );
        assert_eq!(TaskError::Cancelled.to_string(), "cancelled");
    }
}
