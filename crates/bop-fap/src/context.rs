//! Per-store entry point for fast peer addition.
//!
//! [`FastAddPeerContext`] is created when a store starts and owns the
//! scheduler, the temp page store cache, and the runtime they run on.
//! Dropping it shuts all of them down.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::catalog::ManifestCatalog;
use crate::checkpoint::{KeyTemplate, ManifestKey, Sequence, StoreId};
use crate::error::ErrorCode;
use crate::local_cache::{ResidentCacheConfig, ResidentCacheError, ResidentFileCache};
use crate::region::RegionId;
use crate::remote_store::RemoteObjectStore;
use crate::restore::{RegionRestorer, StoreResolver};
use crate::result::{FastAddPeerResult, FastAddPeerStatus};
use crate::runtime::{FapRuntime, FapRuntimeError, FapRuntimeOptions};
use crate::scheduler::{FastAddPeerScheduler, ScheduleError, SchedulerConfig};
use crate::temp_store::{BuildError, SharedTempPageStore, TempPageStoreBuilder, TempPageStoreCache};

#[derive(Debug, Clone)]
pub struct FastAddPeerConfig {
    pub scheduler: SchedulerConfig,
    pub runtime: FapRuntimeOptions,
    /// Remote layout of manifest keys; must match the producers' dumps.
    pub manifest_template: KeyTemplate,
    /// Keep downloaded data files on local disk when set.
    pub resident_cache: Option<ResidentCacheConfig>,
    pub verify_checksums: bool,
}

impl Default for FastAddPeerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            runtime: FapRuntimeOptions::default(),
            manifest_template: KeyTemplate::default_manifest(),
            resident_cache: None,
            verify_checksums: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Runtime(#[from] FapRuntimeError),
    #[error("resident cache: {0}")]
    ResidentCache(#[from] ResidentCacheError),
}

impl ContextError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ContextError::Runtime(_) => ErrorCode::ConfigurationError,
            ContextError::ResidentCache(err) => err.code(),
        }
    }
}

pub struct FastAddPeerContext {
    runtime: Arc<FapRuntime>,
    owns_runtime: bool,
    catalog: ManifestCatalog,
    cache: Arc<TempPageStoreCache>,
    restorer: Arc<RegionRestorer>,
    scheduler: FastAddPeerScheduler,
}

impl FastAddPeerContext {
    /// Create a context with its own runtime.
    pub fn new(
        config: FastAddPeerConfig,
        remote: Arc<dyn RemoteObjectStore>,
        resolver: Arc<dyn StoreResolver>,
    ) -> Result<Self, ContextError> {
        let runtime = FapRuntime::create(config.runtime.clone())?;
        Self::build(runtime, true, config, remote, resolver)
    }

    /// Create a context on a runtime shared with other components. The
    /// runtime is left running on shutdown.
    pub fn with_runtime(
        runtime: Arc<FapRuntime>,
        config: FastAddPeerConfig,
        remote: Arc<dyn RemoteObjectStore>,
        resolver: Arc<dyn StoreResolver>,
    ) -> Result<Self, ContextError> {
        Self::build(runtime, false, config, remote, resolver)
    }

    #[instrument(skip_all, fields(pool_size = config.scheduler.pool_size))]
    fn build(
        runtime: Arc<FapRuntime>,
        owns_runtime: bool,
        config: FastAddPeerConfig,
        remote: Arc<dyn RemoteObjectStore>,
        resolver: Arc<dyn StoreResolver>,
    ) -> Result<Self, ContextError> {
        let catalog = ManifestCatalog::new(remote, config.manifest_template);
        let mut builder =
            TempPageStoreBuilder::new(catalog.clone()).with_checksums(config.verify_checksums);
        if let Some(resident_config) = config.resident_cache {
            let resident = ResidentFileCache::new(resident_config)?;
            match resident.cleanup_orphaned() {
                Ok(0) => {}
                Ok(cleaned) => debug!(cleaned, "removed orphaned resident files"),
                Err(err) => warn!(error = %err, "resident cache cleanup failed"),
            }
            builder = builder.with_resident_cache(resident);
        }

        let cache = Arc::new(TempPageStoreCache::new(builder));
        let restorer = Arc::new(RegionRestorer::new(resolver, catalog.clone(), cache.clone()));
        let scheduler = FastAddPeerScheduler::new(runtime.clone(), config.scheduler);
        info!("fast-add-peer context started");

        Ok(Self {
            runtime,
            owns_runtime,
            catalog,
            cache,
            restorer,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> &FastAddPeerScheduler {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<TempPageStoreCache> {
        &self.cache
    }

    pub fn catalog(&self) -> &ManifestCatalog {
        &self.catalog
    }

    pub fn runtime(&self) -> &Arc<FapRuntime> {
        &self.runtime
    }

    pub fn restorer(&self) -> &Arc<RegionRestorer> {
        &self.restorer
    }

    /// Cached view of `(store_id, sequence)`, if inside the store's window.
    pub fn temp_page_store(
        &self,
        store_id: StoreId,
        sequence: Sequence,
    ) -> Option<SharedTempPageStore> {
        self.cache.get(store_id, sequence)
    }

    pub fn reuse_or_create_temp_page_store(
        &self,
        key: &ManifestKey,
    ) -> Result<SharedTempPageStore, BuildError> {
        self.cache.get_or_build(key)
    }

    /// Poll-driven entry used by the replication layer.
    ///
    /// The first call for a region schedules a restore and returns
    /// `WaitForData`; later calls return `WaitForData` until the restore is
    /// done, then hand out its result once.
    #[instrument(skip(self))]
    pub fn fast_add_peer(&self, region_id: RegionId) -> FastAddPeerResult {
        if self.scheduler.is_ready(region_id) {
            if let Ok(result) = self.scheduler.fetch_result(region_id) {
                if result.status.is_terminal_failure() {
                    warn!(status = %result.status, "restore failed, peer needs a regular snapshot");
                } else {
                    debug!(status = %result.status, "restore result fetched");
                }
                return result;
            }
        }

        if !self.scheduler.is_scheduled(region_id) {
            let restorer = self.restorer.clone();
            match self
                .scheduler
                .add_task(region_id, Box::new(move || restorer.restore(region_id)))
            {
                Ok(_) | Err(ScheduleError::AlreadyScheduled(_)) => {}
                Err(err @ ScheduleError::Closed) => {
                    warn!(error = %err, "restore not scheduled");
                    return FastAddPeerResult::with_status(FastAddPeerStatus::Failed);
                }
            }
        }
        FastAddPeerResult::with_status(FastAddPeerStatus::WaitForData)
    }

    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        if self.owns_runtime {
            self.runtime.shutdown();
        }
        info!("fast-add-peer context stopped");
    }
}

impl Drop for FastAddPeerContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FastAddPeerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastAddPeerContext")
            .field("scheduler", &self.scheduler.snapshot())
            .field("cache", &self.cache.snapshot())
            .finish()
    }
}
