use thiserror::Error;
use tidemark_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use tidemark_common::{impl_error_classification, impl_error_conversion};

use crate::ports::{StorageError, TransportError};
use crate::queue::QueueError;

/// Errors raised by the sync coordinator
///
/// Per-operation failures are never errors; they are reported in the
/// [`SyncReport`](tidemark_domain::SyncReport).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync in progress")]
    InProgress,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("executor returned {actual} outcomes for a batch of {expected}")]
    Protocol { expected: usize, actual: usize },

    #[error("no resolver available for '{0}' conflicts")]
    NoResolver(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict resolver failed: {0}")]
    Resolver(String),

    #[error("sync coordinator has been shut down")]
    ShutDown,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl_error_conversion!(SyncError, Common);
impl_error_classification!(SyncError, Common,
    Self::InProgress => {
        retryable: true,
        severity: ErrorSeverity::Info,
        critical: false,
    },
    Self::Transport(_) => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::Protocol { .. } => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: true,
    },
    Self::NoResolver(_) => {
        retryable: false,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::ConflictNotFound(_) => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    },
    Self::Resolver(_) => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::ShutDown => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    },
    Self::Queue(e) => {
        retryable: e.is_retryable(),
        severity: e.severity(),
        critical: e.is_critical(),
    },
    Self::Storage(e) => {
        retryable: e.is_retryable(),
        severity: e.severity(),
        critical: e.is_critical(),
    }
);

pub type SyncResult<T> = Result<T, SyncError>;
