//! Infrastructure errors and conversions from driver errors into port errors.

use thiserror::Error;
use tidemark_common::error::{CommonError, ErrorSeverity};
use tidemark_common::{impl_error_classification, impl_error_conversion};
use tidemark_core::{EngineError, StorageError};

/// Errors raised while assembling or running infrastructure adapters
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("database error: {0}")]
    Database(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid log filter: {0}")]
    Logging(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl_error_conversion!(InfraError, Common);
impl_error_classification!(InfraError, Common,
    Self::Database(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::Http(_) => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::Logging(_) => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    },
    Self::Storage(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::Engine(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    }
);

impl From<r2d2::Error> for InfraError {
    fn from(err: r2d2::Error) -> Self {
        Self::Database(format!("connection pool: {err}"))
    }
}

impl From<rusqlite::Error> for InfraError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

pub type InfraResult<T> = Result<T, InfraError>;

/// Map a rusqlite failure onto the storage port error
///
/// Busy and locked databases are transient and surface as
/// [`StorageError::Unavailable`]; everything else is a persistence failure.
pub(crate) fn sql_error(operation: &str, err: rusqlite::Error) -> StorageError {
    use rusqlite::ffi::ErrorCode;

    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StorageError::Unavailable(format!("{operation}: {err}"))
        }
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::NotADatabase =>
        {
            StorageError::Common(CommonError::persistence_op(
                operation,
                format!("file is not a database: {}", message.clone().unwrap_or_default()),
            ))
        }
        _ => StorageError::Common(CommonError::persistence_op(operation, err.to_string())),
    }
}

pub(crate) fn pool_error(err: r2d2::Error) -> StorageError {
    StorageError::Unavailable(format!("connection pool: {err}"))
}

pub(crate) fn join_error(err: tokio::task::JoinError) -> StorageError {
    StorageError::Common(CommonError::internal(format!("spawn_blocking failed: {err}")))
}

#[cfg(test)]
mod tests {
    use rusqlite::ffi;
    use tidemark_common::ErrorClassification;

    use super::*;

    fn failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), Some("boom".into()))
    }

    #[test]
    fn busy_database_is_unavailable() {
        let err = sql_error("store", failure(ffi::SQLITE_BUSY));
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(err.is_retryable());

        let err = sql_error("store", failure(ffi::SQLITE_LOCKED));
        assert!(matches!(err, StorageError::Unavailable(_)));
    }

    #[test]
    fn other_failures_are_persistence_errors() {
        let err = sql_error("retrieve", rusqlite::Error::InvalidQuery);
        assert!(matches!(err, StorageError::Common(CommonError::Persistence { .. })));
        assert!(err.to_string().contains("retrieve"));

        let err = sql_error("open", failure(ffi::SQLITE_NOTADB));
        assert!(err.to_string().contains("not a database"));
    }

    #[test]
    fn infra_errors_classify() {
        assert!(!InfraError::Database("gone".into()).is_retryable());
        let err = InfraError::from(CommonError::timeout("probe", std::time::Duration::from_secs(1)));
        assert!(err.is_retryable());
        let err = InfraError::from(EngineError::offline());
        assert!(err.to_string().contains("offline"));
    }
}
