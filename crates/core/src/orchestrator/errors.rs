use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidemark_common::error::{CommonError, ErrorClassification};

use crate::cache::CacheError;
use crate::ports::StorageError;
use crate::queue::QueueError;
use crate::sync::SyncError;

/// Coarse category of an [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Storage,
    Network,
    Sync,
    QuotaExceeded,
    Conflict,
    Queue,
    Cache,
    NotInitialized,
    Destroyed,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Network => "network",
            Self::Sync => "sync",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Conflict => "conflict",
            Self::Queue => "queue",
            Self::Cache => "cache",
            Self::NotInitialized => "not_initialized",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error surfaced by [`OfflineEngine`](super::OfflineEngine)
///
/// Component errors are re-tagged with a [`ErrorKind`] and whether the
/// caller can reasonably try again; the original error stays reachable
/// through [`std::error::Error::source`].
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
    #[source]
    pub source: Option<BoxError>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, recoverable: bool) -> Self {
        Self { kind, message: message.into(), recoverable, source: None }
    }

    fn wrap<E>(kind: ErrorKind, error: E) -> Self
    where
        E: ErrorClassification + std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            message: error.to_string(),
            recoverable: error.is_retryable(),
            source: Some(Box::new(error)),
        }
    }

    pub fn not_initialized() -> Self {
        Self::new(ErrorKind::NotInitialized, "engine is not initialized", true)
    }

    pub fn destroyed() -> Self {
        Self::new(ErrorKind::Destroyed, "engine has been destroyed", false)
    }

    pub fn offline() -> Self {
        Self::new(ErrorKind::Network, "cannot sync while offline", true)
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }
}

impl From<StorageError> for EngineError {
    fn from(error: StorageError) -> Self {
        Self::wrap(ErrorKind::Storage, error)
    }
}

impl From<QueueError> for EngineError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::CapacityExceeded { .. } => Self::wrap(ErrorKind::QuotaExceeded, error),
            QueueError::ShutDown => Self::wrap(ErrorKind::Destroyed, error),
            QueueError::Storage(_) => Self::wrap(ErrorKind::Storage, error),
            _ => Self::wrap(ErrorKind::Queue, error),
        }
    }
}

impl From<CacheError> for EngineError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::QuotaExceeded { .. } => Self::wrap(ErrorKind::QuotaExceeded, error),
            CacheError::Fetch { .. } => Self::wrap(ErrorKind::Network, error),
            CacheError::ShutDown => Self::wrap(ErrorKind::Destroyed, error),
            CacheError::Storage(_) => Self::wrap(ErrorKind::Storage, error),
            _ => Self::wrap(ErrorKind::Cache, error),
        }
    }
}

impl From<SyncError> for EngineError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Transport(_) => Self::wrap(ErrorKind::Network, error),
            SyncError::NoResolver(_) | SyncError::ConflictNotFound(_) | SyncError::Resolver(_) => {
                Self::wrap(ErrorKind::Conflict, error)
            }
            SyncError::ShutDown => Self::wrap(ErrorKind::Destroyed, error),
            SyncError::Queue(inner) => Self::from(inner),
            SyncError::Storage(_) => Self::wrap(ErrorKind::Storage, error),
            _ => Self::wrap(ErrorKind::Sync, error),
        }
    }
}

impl From<CommonError> for EngineError {
    fn from(error: CommonError) -> Self {
        Self::wrap(ErrorKind::Storage, error)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        Self::from(CommonError::from(error))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
