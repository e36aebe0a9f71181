//! Read-only page stores materialized from remote checkpoints.
//!
//! A [`TempPageStore`] holds every page of one published checkpoint in
//! memory. [`TempPageStoreCache`] shares them between restore jobs and keeps,
//! per source store, only the newest built sequence `S` and its predecessor
//! `S-1`.
//!
//! # Window policy
//!
//! - `get(store, q)` with `q > S` or `q < S-1` misses; it never builds.
//! - `get(store, q)` with `q` in `{S-1, S}` returns the view built for `q`,
//!   or the `S` view when `q` was never built.
//! - Installing a build for `q > S` advances the window to `q` and drops the
//!   cache's references to every view below `q-1`. Jobs still holding a view
//!   keep it alive; the last reader frees it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::catalog::{CatalogError, ManifestCatalog};
use crate::checkpoint::{
    DataFileId, DataFileRecord, ManifestKey, PageLocation, Sequence, StoreId, WriterInfo, crc64,
};
use crate::error::ErrorCode;
use crate::local_cache::ResidentFileCache;
use crate::page_store::{Page, PageId};
use crate::remote_store::RemoteStoreError;

#[derive(Debug, Error)]
pub enum BuildError {
    /// The manifest could not be loaded; see [`CatalogError::code`].
    #[error("manifest {key}: {source}")]
    Manifest {
        key: ManifestKey,
        #[source]
        source: CatalogError,
    },
    #[error("data file {object_key} of manifest {key} is not visible yet")]
    DataNotVisible { key: ManifestKey, object_key: String },
    #[error("data file {object_key} of manifest {key} is corrupt: {reason}")]
    CorruptDataFile {
        key: ManifestKey,
        object_key: String,
        reason: String,
    },
    #[error("fetching {object_key} for manifest {key}: {source}")]
    Remote {
        key: ManifestKey,
        object_key: String,
        #[source]
        source: RemoteStoreError,
    },
}

impl BuildError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BuildError::Manifest { source, .. } => source.code(),
            BuildError::DataNotVisible { .. } => ErrorCode::DataNotVisible,
            BuildError::CorruptDataFile { .. } => ErrorCode::DataCorruption,
            BuildError::Remote { source, .. } => source.code(),
        }
    }
}

/// In-memory view of one checkpoint.
pub struct TempPageStore {
    key: ManifestKey,
    writer_info: WriterInfo,
    pages: HashMap<PageId, Arc<[u8]>>,
    resident: Option<(ResidentFileCache, Vec<String>)>,
}

pub type SharedTempPageStore = Arc<TempPageStore>;

impl TempPageStore {
    pub fn key(&self) -> ManifestKey {
        self.key
    }

    pub fn store_id(&self) -> StoreId {
        self.key.store_id
    }

    pub fn sequence(&self) -> Sequence {
        self.key.sequence
    }

    pub fn writer_info(&self) -> &WriterInfo {
        &self.writer_info
    }

    pub fn read(&self, id: &PageId) -> Option<Page> {
        self.pages.get(id).map(|data| Page {
            id: id.clone(),
            data: data.clone(),
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl Drop for TempPageStore {
    fn drop(&mut self) {
        if let Some((resident, files)) = self.resident.take() {
            for file in &files {
                resident.unmark_manifest_referenced(file);
            }
        }
        debug!(store_id = self.key.store_id, sequence = self.key.sequence, "temp page store released");
    }
}

impl std::fmt::Debug for TempPageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempPageStore")
            .field("key", &self.key)
            .field("pages", &self.pages.len())
            .finish()
    }
}

/// Materializes [`TempPageStore`]s from the remote catalog.
#[derive(Debug, Clone)]
pub struct TempPageStoreBuilder {
    catalog: ManifestCatalog,
    resident: Option<ResidentFileCache>,
    verify_checksums: bool,
}

impl TempPageStoreBuilder {
    pub fn new(catalog: ManifestCatalog) -> Self {
        Self {
            catalog,
            resident: None,
            verify_checksums: true,
        }
    }

    pub fn with_resident_cache(mut self, resident: ResidentFileCache) -> Self {
        self.resident = Some(resident);
        self
    }

    pub fn with_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn catalog(&self) -> &ManifestCatalog {
        &self.catalog
    }

    #[instrument(skip(self), fields(store_id = key.store_id, sequence = key.sequence))]
    pub fn build(&self, key: &ManifestKey) -> Result<TempPageStore, BuildError> {
        let manifest = self
            .catalog
            .load(key)
            .map_err(|source| BuildError::Manifest { key: *key, source })?;

        let mut files: HashMap<DataFileId, Vec<u8>> = HashMap::with_capacity(manifest.data_files.len());
        for record in &manifest.data_files {
            files.insert(record.id, self.load_data_file(key, record)?);
        }

        let mut pages = HashMap::with_capacity(manifest.pages.len());
        for entry in manifest.pages {
            let data: Arc<[u8]> = match entry.location {
                PageLocation::Inline(data) => Arc::from(data.into_boxed_slice()),
                PageLocation::DataFile { file, offset, size } => {
                    // Range bounds were checked by manifest validation.
                    let raw = files.get(&file).ok_or_else(|| BuildError::CorruptDataFile {
                        key: *key,
                        object_key: file.to_string(),
                        reason: "data file missing from manifest".into(),
                    })?;
                    let start = offset as usize;
                    Arc::from(&raw[start..start + size as usize])
                }
            };
            pages.insert(entry.id, data);
        }

        let resident = self.resident.as_ref().map(|resident| {
            let keys: Vec<String> = manifest.data_files.iter().map(|f| f.key.clone()).collect();
            for file in &keys {
                resident.mark_manifest_referenced(file);
            }
            (resident.clone(), keys)
        });

        debug!(pages = pages.len(), data_files = files.len(), "temp page store built");
        Ok(TempPageStore {
            key: *key,
            writer_info: manifest.writer_info,
            pages,
            resident,
        })
    }

    fn load_data_file(
        &self,
        key: &ManifestKey,
        record: &DataFileRecord,
    ) -> Result<Vec<u8>, BuildError> {
        if let Some(resident) = &self.resident {
            if let Some(guard) = resident.pin(&record.key) {
                match guard.read() {
                    Ok(compressed) => match self.decode_data_file(key, record, &compressed) {
                        Ok(raw) => return Ok(raw),
                        Err(err) => warn!(file = %record.key, error = %err, "discarding resident copy"),
                    },
                    Err(err) => warn!(file = %record.key, error = %err, "resident read failed"),
                }
            }
        }

        let compressed = self.catalog.remote().get(&record.key).map_err(|source| {
            if source.is_not_found() {
                BuildError::DataNotVisible {
                    key: *key,
                    object_key: record.key.clone(),
                }
            } else {
                BuildError::Remote {
                    key: *key,
                    object_key: record.key.clone(),
                    source,
                }
            }
        })?;
        let raw = self.decode_data_file(key, record, &compressed)?;

        if let Some(resident) = &self.resident {
            if let Err(err) = resident.insert(&record.key, &compressed, false) {
                trace!(file = %record.key, error = %err, "data file not kept resident");
            }
        }
        Ok(raw)
    }

    fn decode_data_file(
        &self,
        key: &ManifestKey,
        record: &DataFileRecord,
        compressed: &[u8],
    ) -> Result<Vec<u8>, BuildError> {
        let corrupt = |reason: String| BuildError::CorruptDataFile {
            key: *key,
            object_key: record.key.clone(),
            reason,
        };
        if compressed.len() as u64 != record.compressed_bytes {
            return Err(corrupt(format!(
                "size {} != recorded {}",
                compressed.len(),
                record.compressed_bytes
            )));
        }
        if self.verify_checksums {
            let actual = crc64(compressed);
            if actual != record.checksum {
                return Err(corrupt(format!(
                    "checksum {actual:016x} != recorded {:016x}",
                    record.checksum
                )));
            }
        }
        let raw = zstd::decode_all(compressed).map_err(|err| corrupt(err.to_string()))?;
        if raw.len() as u64 != record.raw_bytes {
            return Err(corrupt(format!(
                "decompressed size {} != recorded {}",
                raw.len(),
                record.raw_bytes
            )));
        }
        Ok(raw)
    }
}

#[derive(Debug, Default)]
struct StoreWindow {
    current: Sequence,
    entries: BTreeMap<Sequence, SharedTempPageStore>,
}

#[derive(Debug, Default)]
struct CacheMetrics {
    builds: AtomicU64,
    build_failures: AtomicU64,
}

/// Snapshot of cache metrics for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempPageStoreCacheSnapshot {
    pub entries: usize,
    pub builds: u64,
    pub build_failures: u64,
}

/// Shared cache of temp page stores keyed by `(store_id, sequence)`.
pub struct TempPageStoreCache {
    builder: TempPageStoreBuilder,
    windows: Mutex<HashMap<StoreId, StoreWindow>>,
    build_locks: DashMap<ManifestKey, Arc<Mutex<()>>>,
    metrics: CacheMetrics,
}

impl TempPageStoreCache {
    pub fn new(builder: TempPageStoreBuilder) -> Self {
        Self {
            builder,
            windows: Mutex::new(HashMap::new()),
            build_locks: DashMap::new(),
            metrics: CacheMetrics::default(),
        }
    }

    pub fn builder(&self) -> &TempPageStoreBuilder {
        &self.builder
    }

    /// Look up a view without building.
    pub fn get(&self, store_id: StoreId, sequence: Sequence) -> Option<SharedTempPageStore> {
        let windows = self.windows.lock().expect("temp store cache mutex poisoned");
        windows.get(&store_id).and_then(|window| {
            if sequence > window.current || sequence.saturating_add(1) < window.current {
                return None;
            }
            window
                .entries
                .get(&sequence)
                .or_else(|| window.entries.get(&window.current))
                .cloned()
        })
    }

    fn exact(&self, key: &ManifestKey) -> Option<SharedTempPageStore> {
        let windows = self.windows.lock().expect("temp store cache mutex poisoned");
        windows
            .get(&key.store_id)
            .and_then(|window| window.entries.get(&key.sequence))
            .cloned()
    }

    /// Return the cached view for `key`, building it if absent.
    ///
    /// Concurrent calls for one key share a single build; builds for
    /// different keys run in parallel. No cache lock is held while building.
    #[instrument(skip(self), fields(store_id = key.store_id, sequence = key.sequence))]
    pub fn get_or_build(&self, key: &ManifestKey) -> Result<SharedTempPageStore, BuildError> {
        if let Some(store) = self.exact(key) {
            return Ok(store);
        }

        let lock = self
            .build_locks
            .entry(*key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let result = {
            let _guard = lock.lock().expect("temp store build lock poisoned");
            match self.exact(key) {
                Some(store) => {
                    trace!("joined concurrent build");
                    Ok(store)
                }
                None => {
                    match self.builder.build(key) {
                        Ok(store) => {
                            self.metrics.builds.fetch_add(1, Ordering::Relaxed);
                            Ok(self.install(store))
                        }
                        Err(err) => {
                            self.metrics.build_failures.fetch_add(1, Ordering::Relaxed);
                            debug!(error = %err, code = %err.code(), "temp page store build failed");
                            Err(err)
                        }
                    }
                }
            }
        };
        drop(lock);
        self.build_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Insert a built view, advancing the store's window when it is newer.
    pub fn install(&self, store: TempPageStore) -> SharedTempPageStore {
        let key = store.key();
        let shared = Arc::new(store);
        let mut evicted = Vec::new();
        let result = {
            let mut windows = self.windows.lock().expect("temp store cache mutex poisoned");
            let window = windows.entry(key.store_id).or_insert_with(|| StoreWindow {
                current: key.sequence,
                entries: BTreeMap::new(),
            });

            if window.entries.is_empty() || key.sequence > window.current {
                let previous = window.current;
                window.current = key.sequence;
                window.entries.insert(key.sequence, shared.clone());
                let keep_from = key.sequence.saturating_sub(1);
                let kept = window.entries.split_off(&keep_from);
                evicted.extend(std::mem::replace(&mut window.entries, kept).into_values());
                info!(
                    store_id = key.store_id,
                    previous,
                    current = key.sequence,
                    evicted = evicted.len(),
                    "temp page store window advanced"
                );
                shared
            } else if key.sequence.saturating_add(1) >= window.current {
                window
                    .entries
                    .entry(key.sequence)
                    .or_insert_with(|| shared.clone())
                    .clone()
            } else {
                debug!(
                    store_id = key.store_id,
                    sequence = key.sequence,
                    current = window.current,
                    "view older than window, not cached"
                );
                shared
            }
        };
        drop(evicted);
        result
    }

    /// Drop every cached view of `store_id`. Returns how many were dropped.
    pub fn evict_store(&self, store_id: StoreId) -> usize {
        let removed = self
            .windows
            .lock()
            .expect("temp store cache mutex poisoned")
            .remove(&store_id);
        removed.map(|window| window.entries.len()).unwrap_or(0)
    }

    pub fn current_sequence(&self, store_id: StoreId) -> Option<Sequence> {
        self.windows
            .lock()
            .expect("temp store cache mutex poisoned")
            .get(&store_id)
            .map(|window| window.current)
    }

    pub fn snapshot(&self) -> TempPageStoreCacheSnapshot {
        let entries = self
            .windows
            .lock()
            .expect("temp store cache mutex poisoned")
            .values()
            .map(|window| window.entries.len())
            .sum();
        TempPageStoreCacheSnapshot {
            entries,
            builds: self.metrics.builds.load(Ordering::Relaxed),
            build_failures: self.metrics.build_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TempPageStoreCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempPageStoreCache")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
