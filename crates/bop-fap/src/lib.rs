mod catalog;
pub mod checkpoint;
mod context;
mod error;
mod local_cache;
mod page_store;
pub mod region;
pub mod remote_store;
mod restore;
mod result;
mod runtime;
mod scheduler;
mod temp_store;

pub use catalog::{CatalogError, ManifestCatalog, ManifestSet};
pub use checkpoint::{
    CheckpointError, CheckpointManifest, CheckpointUploader, DumpCheckpointOptions,
    DumpCheckpointOutcome, KeyTemplate, LocalCheckpointFile, LocalCheckpointFiles, ManifestKey,
    PersistCheckpoint, Sequence, StoreId, WriterInfo,
};
pub use context::{ContextError, FastAddPeerConfig, FastAddPeerContext};
pub use error::ErrorCode;
pub use local_cache::{
    ResidentCacheConfig, ResidentCacheError, ResidentFileCache, ResidentFileGuard,
};
pub use page_store::{
    Page, PageId, PageStore, PageStoreError, PageStoreOptions, WriteBatch, WriteCallback,
};
pub use region::{ApplyState, RegionId, RegionLocalState};
pub use remote_store::{
    MemoryObjectStore, RemoteObjectStore, RemoteStoreConfig, RemoteStoreError, S3ObjectStore,
};
pub use restore::{RegionRestorer, StoreResolver, classify_build_error};
pub use result::{FastAddPeerResult, FastAddPeerStatus};
pub use runtime::{FapRuntime, FapRuntimeError, FapRuntimeOptions};
pub use scheduler::{
    FastAddPeerJob, FastAddPeerScheduler, FetchError, ScheduleError, SchedulerConfig,
    SchedulerSnapshot, TaskHandle, TaskId,
};
pub use temp_store::{
    BuildError, SharedTempPageStore, TempPageStore, TempPageStoreBuilder, TempPageStoreCache,
    TempPageStoreCacheSnapshot,
};
