//! Offline cache
//!
//! Keyed JSON values with a per-entry TTL, a global byte budget and one of
//! five read strategies. Values can be stored gzip-compressed. Remote reads
//! are supplied per call as a [`Fallback`].
//!
//! ```ignore
//! let forecast = cache
//!     .get(
//!         "weather:lisbon",
//!         GetOptions::default()
//!             .with_strategy(CacheStrategy::StaleWhileRevalidate)
//!             .with_fetch(|| async { api.forecast("lisbon").await }),
//!     )
//!     .await?;
//! ```

mod core;
mod errors;
mod prefetch;
mod stats;

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tidemark_domain::{CacheStrategy, Metadata};

pub use self::core::OfflineCache;
pub use errors::{CacheError, CacheResult};
pub use prefetch::PrefetchOptions;
pub use stats::{CacheStats, PruneReport};

/// Pending result of a remote read
pub type FetchFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Remote read invoked on a miss, a refresh or a prefetch
pub type Fallback = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Wrap an async closure as a [`Fallback`]
pub fn fallback<F, Fut>(f: F) -> Fallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Write parameters; unset fields use the cache defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    pub strategy: Option<CacheStrategy>,
    pub ttl: Option<Duration>,
    pub metadata: Metadata,
    pub compress: bool,
}

impl SetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Read parameters
///
/// `ttl` and `compress` apply to values fetched through the fallback.
#[derive(Clone, Default)]
pub struct GetOptions {
    pub strategy: Option<CacheStrategy>,
    pub fallback: Option<Fallback>,
    /// Refresh in the background even on a cache-first hit
    pub revalidate: bool,
    pub ttl: Option<Duration>,
    pub compress: bool,
}

impl std::fmt::Debug for GetOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetOptions")
            .field("strategy", &self.strategy)
            .field("fallback", &self.fallback.is_some())
            .field("revalidate", &self.revalidate)
            .field("ttl", &self.ttl)
            .field("compress", &self.compress)
            .finish()
    }
}

impl GetOptions {
    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_fetch<F, Fut>(self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.with_fallback(fallback(f))
    }

    pub fn revalidate(mut self) -> Self {
        self.revalidate = true;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }
}
