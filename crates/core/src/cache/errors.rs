use thiserror::Error;
use tidemark_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use tidemark_common::{impl_error_classification, impl_error_conversion};

use crate::ports::StorageError;

/// Errors raised by the cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("entry '{key}' is {size} bytes, larger than the {max} byte cache budget")]
    QuotaExceeded { key: String, size: u64, max: u64 },

    #[error("network-only read of '{0}' needs a fallback")]
    MissingFallback(String),

    #[error("fetching '{key}' failed: {message}")]
    Fetch { key: String, message: String },

    #[error("cached value for '{key}' could not be decoded: {message}")]
    Decode { key: String, message: String },

    #[error("cache has been shut down")]
    ShutDown,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl_error_conversion!(CacheError, Common);
impl_error_classification!(CacheError, Common,
    Self::QuotaExceeded { .. } => {
        retryable: false,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::MissingFallback(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::Fetch { .. } => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::Decode { .. } => {
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

pub type CacheResult<T> = Result<T, CacheError>;
