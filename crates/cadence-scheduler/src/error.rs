//! Error types for the scheduler engine.

use thiserror::Error;

/// Errors surfaced at definition or registration time, or by engine
/// plumbing (lock backends, run stores).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid job definition.
    #[error("invalid job definition: {0}")]
    InvalidDefinition(String),

    /// Malformed cron expression.
    #[error("Invalid cron expression: {0}")]
    InvalidCronExpression(String),

    /// Unknown IANA timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Job already registered under this code.
    #[error("job already exists: {0}")]
    JobExists(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Distributed lock backend error.
    #[error("lock backend error: {0}")]
    Lock(#[from] LockError),

    /// Run-history store error.
    #[error("run store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from a distributed lock backend.
///
/// A lock that is simply held by someone else is not an error; backends
/// report that through `acquire` returning `false`.
#[derive(Debug, Error)]
pub enum LockError {
    /// The backend could not be reached or rejected the operation.
    #[error("lock backend unavailable: {0}")]
    Backend(String),
}

/// Errors from a run-history store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),

    /// No run recorded under this id.
    #[error("run not found: {0}")]
    RunNotFound(String),
}

/// Errors raised by job execution.
///
/// These are recoverable: the scheduler routes them to the job's
/// `on_error` callback and consults the retry policy. The `kind` is what
/// retry allow/deny filters match against.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The attempt exceeded the definition's timeout.
    #[error("job timed out after {0}s")]
    Timeout(u64),

    /// A blocking job body panicked.
    #[error("job panicked: {0}")]
    Panic(String),

    /// The job body reported a failure.
    #[error("{message}")]
    Failed {
        /// Kind tag matched by retry filters.
        kind: String,
        /// Human-readable failure description.
        message: String,
    },
}

impl JobError {
    /// Failure with the default `"error"` kind.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failed {
            kind: "error".to_string(),
            message: message.into(),
        }
    }

    /// Failure tagged with a kind that retry filters can match on.
    pub fn failure_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Kind used by retry policy allow/deny filters.
    pub fn kind(&self) -> &str {
        match self {
            JobError::Timeout(_) => "timeout",
            JobError::Panic(_) => "panic",
            JobError::Failed { kind, .. } => kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_tag() {
        assert_eq!(JobError::failure("boom").kind(), "error");
        assert_eq!(JobError::failure_kind("io", "disk gone").kind(), "io");
        assert_eq!(JobError::Timeout(30).kind(), "timeout");
        assert_eq!(JobError::Panic("oops".to_string()).kind(), "panic");
    }

    #[test]
    fn test_cron_error_message_prefix() {
        let err = SchedulerError::InvalidCronExpression("* * *".to_string());
        assert!(err.to_string().starts_with("Invalid cron expression"));
    }
}
