//! On-disk cache of downloaded checkpoint data files.
//!
//! Consecutive incremental checkpoints of a store share most of their data
//! files. Keeping downloaded files on local disk lets a later build reuse
//! them instead of fetching them again.
//!
//! Eviction policy:
//! - LRU eviction when the byte budget is exceeded
//! - Never evicts files referenced by a live temp page store
//! - Never evicts files pinned by an in-progress build
//! - Never evicts files younger than `min_eviction_age`

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, trace};

use crate::error::ErrorCode;

#[derive(Debug, Error)]
pub enum ResidentCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resident cache full: {used_bytes} / {quota_bytes} bytes")]
    QuotaExhausted { used_bytes: u64, quota_bytes: u64 },
}

impl ResidentCacheError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ResidentCacheError::Io(_) => ErrorCode::IoFailure,
            ResidentCacheError::QuotaExhausted { .. } => ErrorCode::StorageFailure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResidentCacheConfig {
    pub cache_dir: PathBuf,
    pub max_cache_bytes: u64,
    /// Minimum age before a file may be evicted (prevents thrashing).
    pub min_eviction_age: Duration,
}

impl Default for ResidentCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("fap_resident_cache"),
            max_cache_bytes: 1024 * 1024 * 1024, // 1 GiB
            min_eviction_age: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct ResidentFile {
    path: PathBuf,
    size_bytes: u64,
    last_access: SystemTime,
    /// Live temp page stores built from this file.
    manifest_refs: u32,
    pin_count: u32,
}

#[derive(Debug, Default)]
struct ResidentState {
    files: HashMap<String, ResidentFile>,
    lru_order: VecDeque<String>,
    used_bytes: u64,
}

impl ResidentState {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru_order.iter().position(|k| k == key) {
            if let Some(k) = self.lru_order.remove(pos) {
                self.lru_order.push_back(k);
            }
        }
    }
}

#[derive(Debug)]
struct ResidentInner {
    config: ResidentCacheConfig,
    state: Mutex<ResidentState>,
}

/// LRU cache of remote objects kept as files under `cache_dir`.
#[derive(Debug, Clone)]
pub struct ResidentFileCache {
    inner: Arc<ResidentInner>,
}

/// Keeps a resident file from being evicted until dropped.
#[derive(Debug)]
pub struct ResidentFileGuard {
    inner: Arc<ResidentInner>,
    key: String,
    path: PathBuf,
}

impl ResidentFileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Vec<u8>, ResidentCacheError> {
        Ok(fs::read(&self.path)?)
    }
}

impl Drop for ResidentFileGuard {
    fn drop(&mut self) {
        let mut state = self
            .inner
            .state
            .lock()
            .expect("resident cache mutex poisoned");
        if let Some(file) = state.files.get_mut(&self.key) {
            file.pin_count = file.pin_count.saturating_sub(1);
        }
    }
}

impl ResidentFileCache {
    pub fn new(config: ResidentCacheConfig) -> Result<Self, ResidentCacheError> {
        fs::create_dir_all(&config.cache_dir)?;
        Ok(Self {
            inner: Arc::new(ResidentInner {
                config,
                state: Mutex::new(ResidentState::default()),
            }),
        })
    }

    fn file_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '.' })
            .collect();
        self.inner.config.cache_dir.join(name)
    }

    /// Pin `key` if resident, marking it most recently used.
    pub fn pin(&self, key: &str) -> Option<ResidentFileGuard> {
        let mut state = self
            .inner
            .state
            .lock()
            .expect("resident cache mutex poisoned");
        let file = state.files.get_mut(key)?;
        file.pin_count += 1;
        file.last_access = SystemTime::now();
        let path = file.path.clone();
        state.touch(key);
        trace!(key, "resident cache hit");
        Some(ResidentFileGuard {
            inner: self.inner.clone(),
            key: key.to_string(),
            path,
        })
    }

    /// Store `data` under `key`, evicting LRU files as needed.
    pub fn insert(
        &self,
        key: &str,
        data: &[u8],
        manifest_referenced: bool,
    ) -> Result<(), ResidentCacheError> {
        let size_bytes = data.len() as u64;
        let path = self.file_path(key);

        let mut state = self
            .inner
            .state
            .lock()
            .expect("resident cache mutex poisoned");
        if let Some(existing) = state.files.get(key) {
            if existing.pin_count > 0 {
                // Same remote key means same content; keep the pinned copy.
                return Ok(());
            }
        }
        let mut manifest_refs = u32::from(manifest_referenced);
        if let Some(existing) = state.files.remove(key) {
            manifest_refs += existing.manifest_refs;
            state.used_bytes = state.used_bytes.saturating_sub(existing.size_bytes);
            if let Some(pos) = state.lru_order.iter().position(|k| k == key) {
                state.lru_order.remove(pos);
            }
        }

        self.evict_to_fit(&mut state, size_bytes)?;
        fs::write(&path, data)?;

        state.files.insert(
            key.to_string(),
            ResidentFile {
                path,
                size_bytes,
                last_access: SystemTime::now(),
                manifest_refs,
                pin_count: 0,
            },
        );
        state.lru_order.push_back(key.to_string());
        state.used_bytes = state.used_bytes.saturating_add(size_bytes);
        Ok(())
    }

    /// Add a reference that protects `key` from eviction.
    pub fn mark_manifest_referenced(&self, key: &str) {
        let mut state = self
            .inner
            .state
            .lock()
            .expect("resident cache mutex poisoned");
        if let Some(file) = state.files.get_mut(key) {
            file.manifest_refs += 1;
        }
    }

    pub fn unmark_manifest_referenced(&self, key: &str) {
        let mut state = self
            .inner
            .state
            .lock()
            .expect("resident cache mutex poisoned");
        if let Some(file) = state.files.get_mut(key) {
            file.manifest_refs = file.manifest_refs.saturating_sub(1);
        }
    }

    fn evict_to_fit(
        &self,
        state: &mut ResidentState,
        needed_bytes: u64,
    ) -> Result<(), ResidentCacheError> {
        let quota = self.inner.config.max_cache_bytes;
        let available = quota.saturating_sub(state.used_bytes);
        if available >= needed_bytes {
            return Ok(());
        }

        let mut bytes_to_free = needed_bytes - available;
        let now = SystemTime::now();
        let min_age = self.inner.config.min_eviction_age;
        let initial_size = state.lru_order.len();
        let mut examined = 0;
        let mut skipped = Vec::new();

        while bytes_to_free > 0 && examined < initial_size {
            let Some(key) = state.lru_order.pop_front() else {
                break;
            };
            examined += 1;

            let Some(file) = state.files.get(&key) else {
                continue;
            };
            let too_young = now
                .duration_since(file.last_access)
                .map(|age| age < min_age)
                .unwrap_or(false);
            if file.manifest_refs > 0 || file.pin_count > 0 || too_young {
                skipped.push(key);
                continue;
            }

            if let Some(file) = state.files.remove(&key) {
                state.used_bytes = state.used_bytes.saturating_sub(file.size_bytes);
                bytes_to_free = bytes_to_free.saturating_sub(file.size_bytes);
                let _ = fs::remove_file(&file.path);
                debug!(key, bytes = file.size_bytes, "evicted resident file");
            }
        }

        for key in skipped {
            state.lru_order.push_back(key);
        }

        if quota.saturating_sub(state.used_bytes) < needed_bytes {
            return Err(ResidentCacheError::QuotaExhausted {
                used_bytes: state.used_bytes,
                quota_bytes: quota,
            });
        }
        Ok(())
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner
            .state
            .lock()
            .expect("resident cache mutex poisoned")
            .used_bytes
    }

    pub fn file_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("resident cache mutex poisoned")
            .files
            .len()
    }

    /// Remove files in `cache_dir` that are not tracked, e.g. left behind by
    /// a previous process.
    pub fn cleanup_orphaned(&self) -> Result<usize, ResidentCacheError> {
        let state = self
            .inner
            .state
            .lock()
            .expect("resident cache mutex poisoned");
        let tracked: HashSet<&PathBuf> = state.files.values().map(|f| &f.path).collect();

        let mut cleaned = 0;
        for entry in fs::read_dir(&self.inner.config.cache_dir)? {
            let path = entry?.path();
            if path.is_file() && !tracked.contains(&path) {
                fs::remove_file(&path)?;
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}
