use thiserror::Error;
use tidemark_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use tidemark_common::{impl_error_classification, impl_error_conversion};
use tidemark_domain::OperationStatus;

use crate::ports::StorageError;

/// Errors raised by the operation queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("operation not found: {0}")]
    NotFound(String),

    #[error("queue is full ({max} operations) and nothing pending can be dropped")]
    CapacityExceeded { max: usize },

    #[error("cannot {action} operation {id} while {status}")]
    InvalidTransition { id: String, status: OperationStatus, action: &'static str },

    #[error("update would break operation invariant: {0}")]
    Invariant(String),

    #[error("queue has been shut down")]
    ShutDown,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl_error_conversion!(QueueError, Common);
impl_error_classification!(QueueError, Common,
    Self::NotFound(_) => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    },
    Self::CapacityExceeded { .. } => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::InvalidTransition { .. } => {
        retryable: false,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::Invariant(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::ShutDown => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    },
    Self::Storage(e) => {
        retryable: e.is_retryable(),
        severity: e.severity(),
        critical: e.is_critical(),
    }
);

pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_status() {
        let err = QueueError::InvalidTransition {
            id: "op-1".into(),
            status: OperationStatus::Completed,
            action: "cancel",
        };
        assert_eq!(err.to_string(), "cannot cancel operation op-1 while completed");
        assert!(!err.is_retryable());
    }

    #[test]
    fn storage_classification_passes_through() {
        let err = QueueError::from(StorageError::Unavailable("locked".into()));
        assert!(err.is_retryable());
        assert_eq!(err.severity(), ErrorSeverity::Warning);
    }
}
