use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::checkpoint::{
    CheckpointManifest, KeyArgs, KeyTemplate, ManifestDecodeError, ManifestKey, StoreId,
    TemplateError,
};
use crate::error::ErrorCode;
use crate::remote_store::{RemoteObjectStore, RemoteStoreError};

#[derive(Debug, Error)]
pub enum CatalogError {
    /// Listing the manifest namespace failed. Not retried internally.
    #[error("manifest catalog unavailable for store {store_id}: {source}")]
    Unavailable {
        store_id: StoreId,
        #[source]
        source: RemoteStoreError,
    },
    #[error("manifest {key} could not be fetched: {source}")]
    Fetch {
        key: ManifestKey,
        #[source]
        source: RemoteStoreError,
    },
    #[error("manifest {key} is malformed: {source}")]
    Malformed {
        key: ManifestKey,
        #[source]
        source: ManifestDecodeError,
    },
    #[error("manifest object {object_key} holds {found} instead of {key}")]
    Mismatch {
        key: ManifestKey,
        found: ManifestKey,
        object_key: String,
    },
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl CatalogError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CatalogError::Unavailable { .. } => ErrorCode::CatalogUnavailable,
            CatalogError::Fetch { source, .. } => source.code(),
            CatalogError::Malformed { .. } | CatalogError::Mismatch { .. } => {
                ErrorCode::ManifestCorrupt
            }
            CatalogError::Template(err) => err.code(),
        }
    }
}

/// Manifests visible for one store at listing time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSet {
    keys: BTreeSet<ManifestKey>,
}

impl ManifestSet {
    pub fn latest_manifest_key(&self) -> Option<ManifestKey> {
        self.keys.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestKey> {
        self.keys.iter()
    }
}

impl FromIterator<ManifestKey> for ManifestSet {
    fn from_iter<I: IntoIterator<Item = ManifestKey>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

/// Lists and loads checkpoint manifests from remote storage.
#[derive(Clone)]
pub struct ManifestCatalog {
    remote: Arc<dyn RemoteObjectStore>,
    template: KeyTemplate,
}

impl ManifestCatalog {
    pub fn new(remote: Arc<dyn RemoteObjectStore>, template: KeyTemplate) -> Self {
        Self { remote, template }
    }

    pub fn template(&self) -> &KeyTemplate {
        &self.template
    }

    pub fn remote(&self) -> &Arc<dyn RemoteObjectStore> {
        &self.remote
    }

    #[instrument(skip(self))]
    pub fn list_manifests(&self, store_id: StoreId) -> Result<ManifestSet, CatalogError> {
        let prefix = self.template.prefix(&KeyArgs::store(store_id));
        let objects = self
            .remote
            .list(&prefix)
            .map_err(|source| CatalogError::Unavailable { store_id, source })?;

        let mut keys = BTreeSet::new();
        for object in objects {
            match ManifestKey::parse(&self.template, &object) {
                Some(key) if key.store_id == store_id => {
                    keys.insert(key);
                }
                _ => warn!(object, "skipping object that is not a manifest of this store"),
            }
        }
        debug!(manifests = keys.len(), "listed manifests");
        Ok(ManifestSet { keys })
    }

    /// Fetch and decode the manifest published under `key`.
    pub fn load(&self, key: &ManifestKey) -> Result<CheckpointManifest, CatalogError> {
        let object_key = key.object_key(&self.template)?;
        let bytes = self
            .remote
            .get(&object_key)
            .map_err(|source| CatalogError::Fetch { key: *key, source })?;
        let manifest = CheckpointManifest::decode(&bytes)
            .map_err(|source| CatalogError::Malformed { key: *key, source })?;
        if manifest.key() != *key {
            return Err(CatalogError::Mismatch {
                key: *key,
                found: manifest.key(),
                object_key,
            });
        }
        Ok(manifest)
    }
}

impl std::fmt::Debug for ManifestCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestCatalog")
            .field("template", &self.template.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_store::MemoryObjectStore;

    struct Unreachable;

    impl RemoteObjectStore for Unreachable {
        fn create_bucket(&self, _bucket: &str) -> Result<(), RemoteStoreError> {
            Err(RemoteStoreError::Unavailable("offline".into()))
        }
        fn put(&self, _key: &str, _data: &[u8]) -> Result<(), RemoteStoreError> {
            Err(RemoteStoreError::Unavailable("offline".into()))
        }
        fn get(&self, _key: &str) -> Result<Vec<u8>, RemoteStoreError> {
            Err(RemoteStoreError::Unavailable("offline".into()))
        }
        fn list(&self, _prefix: &str) -> Result<Vec<String>, RemoteStoreError> {
            Err(RemoteStoreError::Unavailable("offline".into()))
        }
    }

    fn publish(remote: &MemoryObjectStore, store_id: StoreId, sequence: u64) {
        let key = ManifestKey::new(store_id, sequence)
            .object_key(&KeyTemplate::default_manifest())
            .unwrap();
        remote.put(&key, b"opaque").unwrap();
    }

    #[test]
    fn latest_is_highest_sequence() {
        let remote = Arc::new(MemoryObjectStore::new());
        for sequence in [997, 1000, 998] {
            publish(&remote, 1, sequence);
        }
        publish(&remote, 2, 5000);
        remote.put("s0000000000000001/manifest/mf_garbage", b"x").unwrap();

        let catalog = ManifestCatalog::new(remote, KeyTemplate::default_manifest());
        let set = catalog.list_manifests(1).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.latest_manifest_key(), Some(ManifestKey::new(1, 1000)));
    }

    #[test]
    fn empty_namespace_has_no_latest() {
        let catalog = ManifestCatalog::new(
            Arc::new(MemoryObjectStore::new()),
            KeyTemplate::default_manifest(),
        );
        let set = catalog.list_manifests(9).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.latest_manifest_key(), None);
    }

    #[test]
    fn listing_failure_is_catalog_unavailable() {
        let catalog = ManifestCatalog::new(Arc::new(Unreachable), KeyTemplate::default_manifest());
        let err = catalog.list_manifests(1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CatalogUnavailable);
    }

    #[test]
    fn load_classifies_missing_and_malformed() {
        let remote = Arc::new(MemoryObjectStore::new());
        publish(&remote, 1, 3);
        let catalog = ManifestCatalog::new(remote, KeyTemplate::default_manifest());

        let missing = catalog.load(&ManifestKey::new(1, 4)).unwrap_err();
        assert_eq!(missing.code(), ErrorCode::DataNotVisible);

        let malformed = catalog.load(&ManifestKey::new(1, 3)).unwrap_err();
        assert_eq!(malformed.code(), ErrorCode::ManifestCorrupt);
    }
}
