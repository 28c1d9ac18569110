use rusqlite::Error as RusqliteError;
use std::io;
use strum::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaultLogError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Logger error: {0}")]
    LoggerError(#[from] flexi_logger::FlexiLoggerError),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Error capture is already installed")]
    AlreadyInstalled,

    #[error("Error: {0}")]
    Error(String),
}

/// The stage of a read at which the backing store failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum StoreErrorKind {
    #[strum(serialize = "connection")]
    Connection,
    #[strum(serialize = "prepare")]
    Prepare,
    #[strum(serialize = "execute")]
    Execute,
    #[strum(serialize = "bind")]
    Bind,
    #[strum(serialize = "fetch")]
    Fetch,
}

/// Read-path failures. Each variant names the step that failed so the report can
/// say exactly why the log could not be retrieved.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database connection failed: {0}")]
    Connection(#[source] r2d2::Error),

    #[error("Query preparation failed: {0}")]
    Prepare(#[source] RusqliteError),

    #[error("Query execution failed: {0}")]
    Execute(#[source] RusqliteError),

    #[error("Query result binding failed: {0}")]
    Bind(#[source] RusqliteError),

    #[error("Fetching query result failed: {0}")]
    Fetch(#[source] RusqliteError),
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            StoreError::Connection(_) => StoreErrorKind::Connection,
            StoreError::Prepare(_) => StoreErrorKind::Prepare,
            StoreError::Execute(_) => StoreErrorKind::Execute,
            StoreError::Bind(_) => StoreErrorKind::Bind,
            StoreError::Fetch(_) => StoreErrorKind::Fetch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_kind_display() {
        assert_eq!(StoreErrorKind::Connection.to_string(), "connection");
        assert_eq!(StoreErrorKind::Prepare.to_string(), "prepare");
        assert_eq!(StoreErrorKind::Execute.to_string(), "execute");
        assert_eq!(StoreErrorKind::Bind.to_string(), "bind");
        assert_eq!(StoreErrorKind::Fetch.to_string(), "fetch");
    }

    #[test]
    fn test_store_error_kind_matches_variant() {
        let err = StoreError::Prepare(RusqliteError::InvalidQuery);
        assert_eq!(err.kind(), StoreErrorKind::Prepare);
        assert!(err.to_string().starts_with("Query preparation failed"));

        let err = StoreError::Fetch(RusqliteError::QueryReturnedNoRows);
        assert_eq!(err.kind(), StoreErrorKind::Fetch);
    }

    #[test]
    fn test_store_error_converts_into_fault_log_error() {
        let err: FaultLogError = StoreError::Execute(RusqliteError::InvalidQuery).into();
        assert!(matches!(err, FaultLogError::StoreError(_)));
    }
}
