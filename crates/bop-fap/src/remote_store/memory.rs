use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{RemoteObjectStore, RemoteStoreError};

/// In-process object store.
///
/// Objects are kept in a single sorted map so `list` returns keys in the same
/// lexicographic order an S3 listing would. Buckets are tracked only to give
/// `create_bucket` its ownership semantics.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    buckets: Mutex<HashSet<String>>,
    puts: AtomicU64,
    gets: AtomicU64,
    lists: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .expect("memory object store mutex poisoned")
            .remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .expect("memory object store mutex poisoned")
            .contains_key(key)
    }

    pub fn object_count(&self) -> usize {
        self.objects
            .lock()
            .expect("memory object store mutex poisoned")
            .len()
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn list_count(&self) -> u64 {
        self.lists.load(Ordering::Relaxed)
    }
}

impl RemoteObjectStore for MemoryObjectStore {
    fn create_bucket(&self, bucket: &str) -> Result<(), RemoteStoreError> {
        let mut buckets = self
            .buckets
            .lock()
            .expect("memory object store mutex poisoned");
        if !buckets.insert(bucket.to_string()) {
            return Err(RemoteStoreError::BucketAlreadyOwned(bucket.to_string()));
        }
        Ok(())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), RemoteStoreError> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.objects
            .lock()
            .expect("memory object store mutex poisoned")
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, RemoteStoreError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.objects
            .lock()
            .expect("memory object store mutex poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| RemoteStoreError::NotFound(key.to_string()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteStoreError> {
        self.lists.fetch_add(1, Ordering::Relaxed);
        let objects = self
            .objects
            .lock()
            .expect("memory object store mutex poisoned");
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
