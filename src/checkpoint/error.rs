//! Error types for checkpoint operations.

use std::fmt;

use thiserror::Error;

/// Structured classification for checkpoint database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (check/not-null/primary key).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl CheckpointDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                let code = database_error.code();
                if matches!(
                    code.as_deref(),
                    Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
                ) {
                    Self::BusyOrLocked
                } else if database_error.is_check_violation()
                    || database_error.is_unique_violation()
                    || code
                        .as_deref()
                        .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
                {
                    Self::ConstraintViolation
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for CheckpointDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::Io => "io",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    /// Database operation failed.
    #[error("checkpoint database error ({kind}): {message}")]
    Database {
        kind: CheckpointDbErrorKind,
        message: String,
    },

    /// A stored status string is not recognized.
    #[error("invalid checkpoint status '{0}'; expected pending, in_progress, done or failed")]
    InvalidStatus(String),

    /// A stored or requested stage string is not recognized.
    #[error(
        "invalid checkpoint stage '{0}'; expected download, validate, extract, load_entry or load"
    )]
    InvalidStage(String),

    /// Checkpoint detail could not be (de)serialized.
    #[error("invalid checkpoint detail for {key}: {message}")]
    InvalidDetail { key: String, message: String },
}

impl From<sqlx::Error> for CheckpointError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: CheckpointDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl CheckpointError {
    #[must_use]
    pub fn invalid_status(status: &str) -> Self {
        Self::InvalidStatus(status.to_string())
    }

    #[must_use]
    pub fn invalid_stage(stage: &str) -> Self {
        Self::InvalidStage(stage.to_string())
    }

    /// Returns true when this error is a database busy/locked condition.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: CheckpointDbErrorKind::BusyOrLocked,
                ..
            }
        )
    }
}
