//! Composition root for [`OfflineEngine`]
//!
//! Ports not supplied explicitly are derived from [`InfraConfig`]:
//! - storage: [`SqliteStorage`] when `storage.path` is set, otherwise
//!   [`MemoryStorage`]
//! - connectivity: [`HttpConnectivityMonitor`] when `probe.url` is set,
//!   otherwise [`StaticConnectivity`] reporting online
//! - background channel: [`NoopBackgroundChannel`]
//!
//! The remote executor has no default and must always be supplied.

use std::sync::Arc;

use tidemark_common::error::CommonError;
use tidemark_core::ports::{
    BackgroundChannel, ConflictResolver, ConnectivityMonitor, NoopBackgroundChannel,
    RemoteExecutor, StaticConnectivity, StorageAdapter,
};
use tidemark_core::{EngineContext, MemoryStorage, OfflineEngine};
use tracing::{info, instrument};

use crate::config::{ConfigLoader, InfraConfig};
use crate::connectivity::HttpConnectivityMonitor;
use crate::database::SqliteStorage;
use crate::errors::InfraResult;

pub struct EngineBuilder {
    config: InfraConfig,
    context: Option<EngineContext>,
    storage: Option<Arc<dyn StorageAdapter>>,
    executor: Option<Arc<dyn RemoteExecutor>>,
    connectivity: Option<Arc<dyn ConnectivityMonitor>>,
    channel: Option<Arc<dyn BackgroundChannel>>,
    resolvers: Vec<(String, Arc<dyn ConflictResolver>)>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("custom_storage", &self.storage.is_some())
            .field("has_executor", &self.executor.is_some())
            .field("custom_connectivity", &self.connectivity.is_some())
            .field("resolvers", &self.resolvers.len())
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    pub fn new(config: InfraConfig) -> Self {
        Self {
            config,
            context: None,
            storage: None,
            executor: None,
            connectivity: None,
            channel: None,
            resolvers: Vec::new(),
        }
    }

    /// Builder over configuration from files and `TIDEMARK_*` variables
    pub fn from_env() -> InfraResult<Self> {
        Ok(Self::new(ConfigLoader::new().load()?))
    }

    pub fn config(&self) -> &InfraConfig {
        &self.config
    }

    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn RemoteExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivityMonitor>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    #[must_use]
    pub fn channel(mut self, channel: Arc<dyn BackgroundChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Clock, scheduler and event bus; defaults to the production context
    #[must_use]
    pub fn context(mut self, context: EngineContext) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn resolver(mut self, op_type: impl Into<String>, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolvers.push((op_type.into(), resolver));
        self
    }

    /// Assemble the engine without initializing it
    ///
    /// # Errors
    /// Fails when the configuration is invalid, no executor was supplied, or
    /// a configured adapter cannot be opened.
    #[instrument(skip(self))]
    pub async fn build(self) -> InfraResult<OfflineEngine> {
        self.config.validate()?;
        let executor = self
            .executor
            .ok_or_else(|| CommonError::config("a remote executor is required"))?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => open_storage(&self.config).await?,
        };
        let connectivity = match self.connectivity {
            Some(connectivity) => connectivity,
            None => open_connectivity(&self.config).await?,
        };
        let channel =
            self.channel.unwrap_or_else(|| Arc::new(NoopBackgroundChannel) as Arc<dyn BackgroundChannel>);
        let context = self.context.unwrap_or_else(|| {
            EngineContext::production(self.config.engine.orchestrator.event_history_size)
        });

        let engine =
            OfflineEngine::new(self.config.engine, context, storage, executor, connectivity, channel);
        for (op_type, resolver) in self.resolvers {
            engine.register_resolver(op_type, resolver);
        }
        Ok(engine)
    }

    /// [`build`](Self::build) followed by [`OfflineEngine::initialize`]
    pub async fn start(self) -> InfraResult<OfflineEngine> {
        let engine = self.build().await?;
        engine.initialize().await?;
        Ok(engine)
    }
}

async fn open_storage(config: &InfraConfig) -> InfraResult<Arc<dyn StorageAdapter>> {
    match &config.storage.path {
        Some(path) => {
            let storage = SqliteStorage::open(&config.storage)?;
            storage.health_check().await?;
            info!(db_path = %path.display(), "using sqlite storage");
            Ok(Arc::new(storage))
        }
        None => {
            info!("no database path configured, using in-memory storage");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

async fn open_connectivity(config: &InfraConfig) -> InfraResult<Arc<dyn ConnectivityMonitor>> {
    if config.probe.url.is_none() {
        return Ok(Arc::new(StaticConnectivity::online()));
    }
    let monitor = HttpConnectivityMonitor::new(&config.probe)?;
    // Seed the initial status so the engine starts in the right mode
    let status = monitor.probe().await;
    info!(url = %monitor.url(), reachable = status.reachable, "using http connectivity probe");
    Ok(Arc::new(monitor))
}
