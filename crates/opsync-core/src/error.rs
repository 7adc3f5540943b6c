//! Error types for opsync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpsyncError {
    #[error("Exclusivity lock already held: {0}")]
    LockHeld(String),

    #[error("Publication '{0}' does not exist")]
    PublicationMissing(String),

    #[error("Replication slot '{slot}' is still active for PID {pid}")]
    SlotStillActive { slot: String, pid: i32 },

    #[error("Slot reclamation failed: {0}")]
    SlotReclaim(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Failed to apply {entity} change: {message}")]
    Apply { entity: String, message: String },

    #[error("Materialized view refresh failed: {0}")]
    Refresh(String),

    #[error("No data returned from query: {0}")]
    EmptyResult(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OpsyncError>;

impl OpsyncError {
    /// Whether the failure means the database went away (unreachable, reset,
    /// timed out, or our backend was terminated) rather than a logic error.
    pub fn is_connection(&self) -> bool {
        matches!(self, OpsyncError::Connection(_))
    }

    /// Wrap an error raised while applying a change to the analytical store.
    /// Connection failures keep their class so the session can reconnect.
    pub fn apply(entity: impl Into<String>, err: OpsyncError) -> Self {
        match err {
            OpsyncError::Connection(_) => err,
            other => OpsyncError::Apply {
                entity: entity.into(),
                message: other.to_string(),
            },
        }
    }
}

/// SQLSTATE codes that mean the server side of the session is gone.
fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

/// Whether a driver error means the database session is gone.
pub fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map_or(false, |code| is_connection_sqlstate(&code)),
        _ => false,
    }
}

impl From<sqlx::Error> for OpsyncError {
    fn from(err: sqlx::Error) -> Self {
        if is_connection_error(&err) {
            return OpsyncError::Connection(err.to_string());
        }
        match err {
            sqlx::Error::Configuration(_) => OpsyncError::Config(err.to_string()),
            _ => OpsyncError::Database(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for OpsyncError {
    fn from(err: anyhow::Error) -> Self {
        OpsyncError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_connection_class() {
        let err: OpsyncError = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ))
        .into();
        assert!(err.is_connection());

        let err: OpsyncError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_connection());
    }

    #[test]
    fn test_row_not_found_is_not_retryable() {
        let err: OpsyncError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_connection());
        assert!(matches!(err, OpsyncError::Database(_)));
    }

    #[test]
    fn test_sqlstate_classification() {
        assert!(is_connection_sqlstate("08006"));
        assert!(is_connection_sqlstate("57P01"));
        assert!(!is_connection_sqlstate("23505"));
        assert!(!is_connection_sqlstate("42P01"));
    }

    #[test]
    fn test_apply_wrapping_keeps_connection_class() {
        let err = OpsyncError::apply("Order", OpsyncError::Connection("gone".into()));
        assert!(err.is_connection());

        let err = OpsyncError::apply("Order", OpsyncError::Database("bad".into()));
        match err {
            OpsyncError::Apply { entity, message } => {
                assert_eq!(entity, "Order");
                assert!(message.contains("bad"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
