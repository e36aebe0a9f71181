//! Checkpoint publication for fast peer addition.
//!
//! A checkpoint is a set of zstd-compressed data files plus one manifest
//! naming every page of a store at a sequence. The page store stages the
//! files locally, hands them to a [`PersistCheckpoint`] implementation, and
//! only then records the new data files as reusable for later incremental
//! dumps.
//!
//! # Key Types
//!
//! - [`KeyTemplate`]: render/parse remote keys and local staging paths
//! - [`CheckpointManifest`]: the manifest file format
//! - [`DumpCheckpointOptions`]: parameters of one dump
//! - [`CheckpointUploader`]: publishes staged files to a remote store,
//!   data files first and the manifest last

pub mod key;
pub mod manifest;
pub(crate) mod writer;

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::error::ErrorCode;
use crate::remote_store::{RemoteObjectStore, RemoteStoreError};

pub use key::{
    DataFileId, DataFileIndex, KeyArgs, KeyField, KeyTemplate, ManifestKey, Sequence, StoreId,
    TemplateError, TemplateSegment,
};
pub use manifest::{
    CheckpointManifest, DataFileRecord, MANIFEST_MAGIC, MANIFEST_VERSION, ManifestDecodeError,
    PageEntry, PageLocation, WriterInfo,
};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("page store error: {0}")]
    Storage(#[from] heed::Error),
    #[error("key template error: {0}")]
    Template(#[from] TemplateError),
    #[error("manifest encode error: {0}")]
    Manifest(#[from] ManifestDecodeError),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteStoreError),
    #[error("data file indexes exhausted at sequence {0}")]
    IndexExhausted(Sequence),
    #[error("page store belongs to store {actual}, checkpoint requested for {requested}")]
    StoreMismatch { requested: StoreId, actual: StoreId },
    #[error(
        "checkpoint {sequence} was published at write sequence {published_at}, store is now at {current}"
    )]
    SequenceAlreadyPublished {
        sequence: Sequence,
        published_at: Sequence,
        current: Sequence,
    },
}

impl CheckpointError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CheckpointError::Io(_) => ErrorCode::IoFailure,
            CheckpointError::Storage(_) => ErrorCode::StorageFailure,
            CheckpointError::Template(_)
            | CheckpointError::StoreMismatch { .. }
            | CheckpointError::SequenceAlreadyPublished { .. } => ErrorCode::ConfigurationError,
            CheckpointError::Manifest(_) => ErrorCode::ManifestCorrupt,
            CheckpointError::Compression(_) => ErrorCode::DataCorruption,
            CheckpointError::Remote(err) => err.code(),
            CheckpointError::IndexExhausted(_) => ErrorCode::StorageFailure,
        }
    }
}

/// A staged file and the remote key it is published under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCheckpointFile {
    pub path: PathBuf,
    pub key: String,
}

/// Files staged by one dump.
#[derive(Debug, Clone)]
pub struct LocalCheckpointFiles {
    pub manifest_key: ManifestKey,
    /// Only data files created by this dump; reused files are already
    /// published.
    pub data_files: Vec<LocalCheckpointFile>,
    pub manifest_file: LocalCheckpointFile,
}

/// Publishes staged checkpoint files. Invoked once per dump, before the page
/// store marks the new data files as reusable.
pub trait PersistCheckpoint: Send + Sync {
    fn persist(&self, files: &LocalCheckpointFiles) -> Result<(), CheckpointError>;
}

/// Uploads staged files to a [`RemoteObjectStore`].
///
/// The manifest is put last so that a visible manifest implies its data
/// files were already put.
#[derive(Clone)]
pub struct CheckpointUploader {
    remote: Arc<dyn RemoteObjectStore>,
}

impl CheckpointUploader {
    pub fn new(remote: Arc<dyn RemoteObjectStore>) -> Self {
        Self { remote }
    }

    fn upload(&self, file: &LocalCheckpointFile) -> Result<usize, CheckpointError> {
        let data = fs::read(&file.path)?;
        self.remote.put(&file.key, &data)?;
        Ok(data.len())
    }
}

impl PersistCheckpoint for CheckpointUploader {
    #[instrument(skip(self, files), fields(
        store_id = files.manifest_key.store_id,
        sequence = files.manifest_key.sequence,
        data_files = files.data_files.len()
    ))]
    fn persist(&self, files: &LocalCheckpointFiles) -> Result<(), CheckpointError> {
        let mut bytes = 0usize;
        for file in &files.data_files {
            bytes += self.upload(file)?;
        }
        bytes += self.upload(&files.manifest_file)?;
        debug!(bytes, manifest = %files.manifest_file.key, "checkpoint uploaded");
        Ok(())
    }
}

impl std::fmt::Debug for CheckpointUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointUploader").finish()
    }
}

/// Parameters of one incremental checkpoint dump.
#[derive(Clone)]
pub struct DumpCheckpointOptions {
    /// Remote key of each data file.
    pub data_locator_pattern: KeyTemplate,
    /// Local staging path of each data file.
    pub data_path_pattern: KeyTemplate,
    pub manifest_locator_pattern: KeyTemplate,
    pub manifest_path_pattern: KeyTemplate,
    pub writer_info: WriterInfo,
    /// Extra remote objects the checkpoint depends on.
    pub locked_files: BTreeSet<String>,
    pub persist_checkpoint: Arc<dyn PersistCheckpoint>,
    /// Manifest sequence to publish under. Defaults to the store's current
    /// write sequence.
    pub override_sequence: Option<Sequence>,
}

impl DumpCheckpointOptions {
    /// Default remote layout, staging under `staging_dir` as
    /// `dat_{seq}_{index}` and `mf_{seq}`.
    pub fn new(
        store_id: StoreId,
        staging_dir: &Path,
        persist_checkpoint: Arc<dyn PersistCheckpoint>,
    ) -> Self {
        let dir = staging_dir.display().to_string();
        let dir = if dir.ends_with('/') { dir } else { format!("{dir}/") };
        Self {
            data_locator_pattern: KeyTemplate::default_data_file(),
            data_path_pattern: KeyTemplate::new()
                .literal(format!("{dir}dat_"))
                .field(KeyField::Sequence)
                .literal("_")
                .field(KeyField::Index),
            manifest_locator_pattern: KeyTemplate::default_manifest(),
            manifest_path_pattern: KeyTemplate::new()
                .literal(format!("{dir}mf_"))
                .field(KeyField::Sequence),
            writer_info: WriterInfo::new(store_id),
            locked_files: BTreeSet::new(),
            persist_checkpoint,
            override_sequence: None,
        }
    }

    pub fn with_override_sequence(mut self, sequence: Sequence) -> Self {
        self.override_sequence = Some(sequence);
        self
    }

    pub fn with_locked_files(mut self, files: impl IntoIterator<Item = String>) -> Self {
        self.locked_files.extend(files);
        self
    }
}

impl std::fmt::Debug for DumpCheckpointOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpCheckpointOptions")
            .field("data_locator_pattern", &self.data_locator_pattern.to_string())
            .field("manifest_locator_pattern", &self.manifest_locator_pattern.to_string())
            .field("override_sequence", &self.override_sequence)
            .finish()
    }
}

/// Summary of a completed dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpCheckpointOutcome {
    pub manifest_key: ManifestKey,
    pub manifest_object_key: String,
    pub total_pages: usize,
    pub inline_pages: usize,
    pub new_data_files: usize,
    pub reused_data_files: usize,
}

pub(crate) fn crc64(data: &[u8]) -> u64 {
    let mut hasher = crc64fast_nvme::Digest::new();
    hasher.write(data);
    hasher.sum64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_store::MemoryObjectStore;

    #[test]
    fn uploader_puts_manifest_last() {
        let dir = tempfile::tempdir().unwrap();
        let data = LocalCheckpointFile {
            path: dir.path().join("dat_1_0"),
            key: "s1/data/dat_1_0".into(),
        };
        let manifest = LocalCheckpointFile {
            path: dir.path().join("mf_1"),
            key: "s1/manifest/mf_1".into(),
        };
        fs::write(&data.path, b"data").unwrap();
        fs::write(&manifest.path, b"manifest").unwrap();

        let remote = Arc::new(MemoryObjectStore::new());
        let uploader = CheckpointUploader::new(remote.clone());
        uploader
            .persist(&LocalCheckpointFiles {
                manifest_key: ManifestKey::new(1, 1),
                data_files: vec![data],
                manifest_file: manifest,
            })
            .unwrap();
        assert_eq!(remote.get("s1/data/dat_1_0").unwrap(), b"data");
        assert_eq!(remote.get("s1/manifest/mf_1").unwrap(), b"manifest");
        assert_eq!(remote.put_count(), 2);
    }

    #[test]
    fn missing_data_file_aborts_before_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = LocalCheckpointFile {
            path: dir.path().join("mf_1"),
            key: "s1/manifest/mf_1".into(),
        };
        fs::write(&manifest.path, b"manifest").unwrap();

        let remote = Arc::new(MemoryObjectStore::new());
        let uploader = CheckpointUploader::new(remote.clone());
        let err = uploader
            .persist(&LocalCheckpointFiles {
                manifest_key: ManifestKey::new(1, 1),
                data_files: vec![LocalCheckpointFile {
                    path: dir.path().join("absent"),
                    key: "s1/data/dat_1_0".into(),
                }],
                manifest_file: manifest,
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::IoFailure);
        assert!(!remote.contains("s1/manifest/mf_1"));
    }

    #[test]
    fn default_staging_paths() {
        let remote: Arc<dyn RemoteObjectStore> = Arc::new(MemoryObjectStore::new());
        let options = DumpCheckpointOptions::new(
            3,
            Path::new("/tmp/stage"),
            Arc::new(CheckpointUploader::new(remote)),
        )
        .with_override_sequence(1000);
        assert_eq!(options.override_sequence, Some(1000));
        assert_eq!(
            options
                .manifest_path_pattern
                .render(&KeyArgs::manifest(3, 1000))
                .unwrap(),
            "/tmp/stage/mf_00000000000003e8"
        );
        assert_eq!(options.data_path_pattern.to_string(), "/tmp/stage/dat_{seq}_{index}");
    }
}
