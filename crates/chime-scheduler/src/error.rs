use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression is malformed or never fires again.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A management request is missing a required field.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No handler is registered under the requested identifier.
    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    /// No job/trigger with the given key exists in the store.
    #[error("Job not found: {key}")]
    NotFound { key: String },

    /// A job with the given key already exists.
    #[error("Job already exists: {key}")]
    AlreadyExists { key: String },

    /// A compare-and-swap lost its race; retry on the next tick.
    #[error("Conflict on {key}: {reason}")]
    Conflict { key: String, reason: String },

    /// The storage or lock backend is unreachable. Retryable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A job handler returned an error, panicked, or timed out.
    #[error("Handler failure for {key}: {reason}")]
    HandlerFailure { key: String, reason: String },

    /// A persisted row could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Underlying SQLite error that is not retryable.
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    /// `start` was called on an engine whose loop is already running.
    #[error("Scheduler engine is already running")]
    AlreadyRunning,

    /// `stop` was called on an engine that was never started.
    #[error("Scheduler engine is not running")]
    NotRunning,

    #[error("Configuration error: {0}")]
    Config(#[from] chime_core::ChimeError),
}

impl SchedulerError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            SchedulerError::InvalidRequest(_) => "INVALID_REQUEST",
            SchedulerError::InvalidHandler(_) => "INVALID_HANDLER",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::AlreadyExists { .. } => "ALREADY_EXISTS",
            SchedulerError::Conflict { .. } => "CONFLICT",
            SchedulerError::Unavailable(_) => "UNAVAILABLE",
            SchedulerError::HandlerFailure { .. } => "HANDLER_FAILURE",
            SchedulerError::Corrupt(_) => "CORRUPT_RECORD",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::AlreadyRunning => "ALREADY_RUNNING",
            SchedulerError::NotRunning => "NOT_RUNNING",
            SchedulerError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether the dispatch loop should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(err: rusqlite::Error) -> Self {
        // Busy/locked/IO conditions clear up on their own; surface them as
        // Unavailable so the loop retries instead of logging a hard failure.
        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull,
            ) => SchedulerError::Unavailable(err.to_string()),
            _ => SchedulerError::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_database_is_retryable() {
        let err: SchedulerError = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        )
        .into();
        assert!(err.is_retryable());
        assert_eq!(err.code(), "UNAVAILABLE");
    }

    #[test]
    fn constraint_violation_is_not_retryable() {
        let err: SchedulerError = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        )
        .into();
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "DATABASE_ERROR");
    }
}
