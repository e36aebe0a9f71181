//! Local page store backed by LMDB (heed).
//!
//! Pages are opaque byte blobs addressed by [`PageId`]. Every write batch is
//! applied in one LMDB transaction and stamped with the next write sequence.
//! The store remembers which checkpoint data file each page was last packed
//! into, so incremental dumps only pack pages written since.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use heed::types::{Bytes, SerdeBincode, U32, U64, U128};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::checkpoint::writer::{DataFilePacker, write_staged};
use crate::checkpoint::{
    CheckpointError, CheckpointManifest, DataFileId, DataFileRecord, DumpCheckpointOptions,
    DumpCheckpointOutcome, KeyArgs, LocalCheckpointFile, LocalCheckpointFiles, ManifestKey,
    PageEntry, PageLocation, Sequence, StoreId,
};
use crate::error::ErrorCode;

const META_KEY: u32 = 0;

/// Identifier of a page. Orders lexicographically by its bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(Vec<u8>);

impl PageId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId(")?;
        for byte in &self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        write!(f, ")")
    }
}

/// A page read back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub id: PageId,
    pub data: Arc<[u8]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WriteOp {
    Put(PageId, Vec<u8>),
    Delete(PageId),
}

/// Ordered page mutations applied atomically by [`PageStore::write`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, id: PageId, data: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(WriteOp::Put(id, data.into()));
        self
    }

    pub fn delete(&mut self, id: PageId) -> &mut Self {
        self.ops.push(WriteOp::Delete(id));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn merge(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }
}

/// Invoked with the batch's sequence after it commits.
pub type WriteCallback = Box<dyn FnOnce(Sequence) + Send>;

#[derive(Debug, Error)]
pub enum PageStoreError {
    #[error("LMDB error: {0}")]
    Heed(#[from] heed::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("page store at {path} belongs to store {actual}, opened as {requested}")]
    StoreMismatch {
        path: PathBuf,
        requested: StoreId,
        actual: StoreId,
    },
}

impl PageStoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PageStoreError::Heed(_) => ErrorCode::StorageFailure,
            PageStoreError::Io(_) => ErrorCode::IoFailure,
            PageStoreError::StoreMismatch { .. } => ErrorCode::ConfigurationError,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageStoreOptions {
    pub map_size: usize,
    /// Pages at or below this size are embedded in the manifest.
    pub inline_threshold: usize,
    pub max_data_file_bytes: u64,
    pub compression_level: i32,
}

impl Default for PageStoreOptions {
    fn default() -> Self {
        Self {
            map_size: 256 * 1024 * 1024,
            inline_threshold: 64,
            max_data_file_bytes: 8 * 1024 * 1024,
            compression_level: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedLocation {
    file: DataFileId,
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPage {
    sequence: Sequence,
    data: Vec<u8>,
    persisted: Option<PersistedLocation>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct StoreMeta {
    store_id: StoreId,
    write_sequence: Sequence,
    last_checkpoint: Option<Sequence>,
}

/// Checkpoint already published under a sequence. Published manifests are
/// immutable, so a later dump at the same sequence is answered from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PublishedCheckpoint {
    write_sequence: Sequence,
    manifest_object_key: String,
    total_pages: usize,
    inline_pages: usize,
    data_files: usize,
}

struct PageStoreTables {
    pages: Database<Bytes, SerdeBincode<StoredPage>>,
    /// Data files produced by earlier dumps, indexed by `DataFileId`.
    data_files: Database<U128<heed::byteorder::BigEndian>, SerdeBincode<DataFileRecord>>,
    checkpoints: Database<U64<heed::byteorder::BigEndian>, SerdeBincode<PublishedCheckpoint>>,
    meta: Database<U32<heed::byteorder::BigEndian>, SerdeBincode<StoreMeta>>,
}

/// Durable page store for one storage node.
pub struct PageStore {
    store_id: StoreId,
    path: PathBuf,
    env: Env,
    tables: PageStoreTables,
    options: PageStoreOptions,
    dump_lock: Mutex<()>,
}

impl PageStore {
    #[instrument(skip(path, options), fields(path = %path.as_ref().display()))]
    pub fn open(
        path: impl AsRef<Path>,
        store_id: StoreId,
        options: PageStoreOptions,
    ) -> Result<Self, PageStoreError> {
        let path_ref = path.as_ref();
        fs::create_dir_all(path_ref)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size)
                .max_dbs(4)
                .open(path_ref)?
        };

        let mut txn = env.write_txn()?;
        let pages = env.create_database::<Bytes, SerdeBincode<StoredPage>>(&mut txn, Some("pages"))?;
        let data_files = env
            .create_database::<U128<heed::byteorder::BigEndian>, SerdeBincode<DataFileRecord>>(
                &mut txn,
                Some("data_files"),
            )?;
        let checkpoints = env
            .create_database::<U64<heed::byteorder::BigEndian>, SerdeBincode<PublishedCheckpoint>>(
                &mut txn,
                Some("checkpoints"),
            )?;
        let meta = env
            .create_database::<U32<heed::byteorder::BigEndian>, SerdeBincode<StoreMeta>>(
                &mut txn,
                Some("meta"),
            )?;
        match meta.get(&txn, &META_KEY)? {
            Some(existing) if existing.store_id != store_id => {
                return Err(PageStoreError::StoreMismatch {
                    path: path_ref.to_path_buf(),
                    requested: store_id,
                    actual: existing.store_id,
                });
            }
            Some(existing) => {
                debug!(write_sequence = existing.write_sequence, "reopened page store");
            }
            None => {
                meta.put(
                    &mut txn,
                    &META_KEY,
                    &StoreMeta {
                        store_id,
                        write_sequence: 0,
                        last_checkpoint: None,
                    },
                )?;
            }
        }
        txn.commit()?;

        info!("page store opened");
        Ok(Self {
            store_id,
            path: path_ref.to_path_buf(),
            env,
            tables: PageStoreTables {
                pages,
                data_files,
                checkpoints,
                meta,
            },
            options,
            dump_lock: Mutex::new(()),
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_meta(&self, txn: &heed::RoTxn<'_>) -> Result<StoreMeta, heed::Error> {
        Ok(self
            .tables
            .meta
            .get(txn, &META_KEY)?
            .unwrap_or(StoreMeta {
                store_id: self.store_id,
                write_sequence: 0,
                last_checkpoint: None,
            }))
    }

    pub fn write_sequence(&self) -> Result<Sequence, PageStoreError> {
        let txn = self.env.read_txn()?;
        Ok(self.load_meta(&txn)?.write_sequence)
    }

    pub fn last_checkpoint_sequence(&self) -> Result<Option<Sequence>, PageStoreError> {
        let txn = self.env.read_txn()?;
        Ok(self.load_meta(&txn)?.last_checkpoint)
    }

    /// Apply `batch` atomically. Returns the sequence stamped on it; an
    /// empty batch returns the current sequence without advancing it.
    pub fn write(
        &self,
        batch: WriteBatch,
        callback: Option<WriteCallback>,
    ) -> Result<Sequence, PageStoreError> {
        let mut txn = self.env.write_txn()?;
        let mut meta = self.load_meta(&txn)?;
        if batch.is_empty() {
            drop(txn);
            if let Some(callback) = callback {
                callback(meta.write_sequence);
            }
            return Ok(meta.write_sequence);
        }

        let sequence = meta.write_sequence + 1;
        let ops = batch.ops.len();
        for op in batch.ops {
            match op {
                WriteOp::Put(id, data) => {
                    self.tables.pages.put(
                        &mut txn,
                        id.as_bytes(),
                        &StoredPage {
                            sequence,
                            data,
                            persisted: None,
                        },
                    )?;
                }
                WriteOp::Delete(id) => {
                    self.tables.pages.delete(&mut txn, id.as_bytes())?;
                }
            }
        }
        meta.write_sequence = sequence;
        self.tables.meta.put(&mut txn, &META_KEY, &meta)?;
        txn.commit()?;
        trace!(sequence, ops, "write batch committed");

        if let Some(callback) = callback {
            callback(sequence);
        }
        Ok(sequence)
    }

    pub fn read(&self, id: &PageId) -> Result<Option<Page>, PageStoreError> {
        let txn = self.env.read_txn()?;
        Ok(self.tables.pages.get(&txn, id.as_bytes())?.map(|stored| Page {
            id: id.clone(),
            data: Arc::from(stored.data.into_boxed_slice()),
        }))
    }

    pub fn page_count(&self) -> Result<u64, PageStoreError> {
        let txn = self.env.read_txn()?;
        Ok(self.tables.pages.len(&txn)?)
    }

    /// Publish the store's current pages as a checkpoint.
    ///
    /// Pages already packed by an earlier dump keep their data file; pages
    /// written since are packed into new files. New data files become
    /// reusable only after `persist_checkpoint` succeeds.
    ///
    /// A sequence is published at most once. Dumping it again with no writes
    /// in between returns the published outcome without uploading; dumping it
    /// after further writes fails with `SequenceAlreadyPublished`.
    #[instrument(skip(self, options), fields(store_id = self.store_id))]
    pub fn dump_incremental_checkpoint(
        &self,
        options: &DumpCheckpointOptions,
    ) -> Result<DumpCheckpointOutcome, CheckpointError> {
        if options.writer_info.store_id != self.store_id {
            return Err(CheckpointError::StoreMismatch {
                requested: options.writer_info.store_id,
                actual: self.store_id,
            });
        }
        let _guard = self.dump_lock.lock().expect("page store dump mutex poisoned");

        let txn = self.env.read_txn()?;
        let meta = self.load_meta(&txn)?;
        let sequence = options.override_sequence.unwrap_or(meta.write_sequence);
        if let Some(published) = self.tables.checkpoints.get(&txn, &sequence)? {
            if published.write_sequence != meta.write_sequence {
                return Err(CheckpointError::SequenceAlreadyPublished {
                    sequence,
                    published_at: published.write_sequence,
                    current: meta.write_sequence,
                });
            }
            debug!(sequence, "checkpoint already published, nothing to dump");
            return Ok(DumpCheckpointOutcome {
                manifest_key: ManifestKey::new(self.store_id, sequence),
                manifest_object_key: published.manifest_object_key,
                total_pages: published.total_pages,
                inline_pages: published.inline_pages,
                new_data_files: 0,
                reused_data_files: published.data_files,
            });
        }
        let mut snapshot = Vec::new();
        for entry in self.tables.pages.iter(&txn)? {
            let (raw_id, stored) = entry?;
            snapshot.push((PageId::new(raw_id.to_vec()), stored));
        }

        let mut reused: BTreeMap<DataFileId, DataFileRecord> = BTreeMap::new();
        let mut reusable: HashMap<DataFileId, Option<DataFileRecord>> = HashMap::new();
        for (_, stored) in &snapshot {
            if let Some(location) = stored.persisted {
                if let std::collections::hash_map::Entry::Vacant(slot) =
                    reusable.entry(location.file)
                {
                    slot.insert(
                        self.tables
                            .data_files
                            .get(&txn, &location.file.encode())?,
                    );
                }
            }
        }
        drop(txn);

        let mut packer = DataFilePacker::new(
            self.store_id,
            sequence,
            self.options.max_data_file_bytes,
            self.options.compression_level,
            &options.data_locator_pattern,
            &options.data_path_pattern,
        );
        let mut pages = Vec::with_capacity(snapshot.len());
        let mut newly_packed = Vec::new();
        let mut inline_pages = 0usize;
        for (id, stored) in &snapshot {
            let size = stored.data.len() as u64;
            let location = if stored.data.len() <= self.options.inline_threshold {
                inline_pages += 1;
                PageLocation::Inline(stored.data.clone())
            } else if let Some((location, record)) = stored.persisted.and_then(|location| {
                reusable
                    .get(&location.file)
                    .cloned()
                    .flatten()
                    .map(|record| (location, record))
            }) {
                reused.entry(record.id).or_insert(record);
                PageLocation::DataFile {
                    file: location.file,
                    offset: location.offset,
                    size: location.size,
                }
            } else {
                let (file, offset) = packer.push(&stored.data)?;
                newly_packed.push((
                    id.clone(),
                    stored.sequence,
                    PersistedLocation { file, offset, size },
                ));
                PageLocation::DataFile { file, offset, size }
            };
            pages.push(PageEntry {
                id: id.clone(),
                location,
            });
        }
        let sealed = packer.finish()?;

        let mut data_files: Vec<DataFileRecord> = reused.into_values().collect();
        data_files.extend(sealed.iter().map(|(record, _)| record.clone()));
        let mut locked_files: BTreeSet<String> = options.locked_files.clone();
        locked_files.extend(data_files.iter().map(|record| record.key.clone()));

        let manifest = CheckpointManifest {
            store_id: self.store_id,
            sequence,
            writer_info: options.writer_info.clone(),
            data_locator_pattern: options.data_locator_pattern.clone(),
            locked_files,
            data_files,
            pages,
        };
        let manifest_key = ManifestKey::new(self.store_id, sequence);
        let args = KeyArgs::manifest(self.store_id, sequence);
        let manifest_file = LocalCheckpointFile {
            path: PathBuf::from(options.manifest_path_pattern.render(&args)?),
            key: options.manifest_locator_pattern.render(&args)?,
        };
        write_staged(&manifest_file.path, &manifest.encode()?)?;

        let staged = LocalCheckpointFiles {
            manifest_key,
            data_files: sealed.iter().map(|(_, file)| file.clone()).collect(),
            manifest_file,
        };
        let persisted = options.persist_checkpoint.persist(&staged);
        remove_staged(&staged);
        persisted?;

        let mut txn = self.env.write_txn()?;
        for (record, _) in &sealed {
            self.tables
                .data_files
                .put(&mut txn, &record.id.encode(), record)?;
        }
        let mut marked = 0usize;
        for (id, sequence_at_dump, location) in newly_packed {
            if let Some(mut stored) = self.tables.pages.get(&txn, id.as_bytes())? {
                if stored.sequence == sequence_at_dump {
                    stored.persisted = Some(location);
                    self.tables.pages.put(&mut txn, id.as_bytes(), &stored)?;
                    marked += 1;
                }
            }
        }
        self.tables.checkpoints.put(
            &mut txn,
            &sequence,
            &PublishedCheckpoint {
                write_sequence: meta.write_sequence,
                manifest_object_key: staged.manifest_file.key.clone(),
                total_pages: snapshot.len(),
                inline_pages,
                data_files: manifest.data_files.len(),
            },
        )?;
        let mut current = self.load_meta(&txn)?;
        current.last_checkpoint = Some(sequence);
        self.tables.meta.put(&mut txn, &META_KEY, &current)?;
        txn.commit()?;

        let outcome = DumpCheckpointOutcome {
            manifest_key,
            manifest_object_key: staged.manifest_file.key.clone(),
            total_pages: snapshot.len(),
            inline_pages,
            new_data_files: sealed.len(),
            reused_data_files: manifest.data_files.len() - sealed.len(),
        };
        info!(
            sequence,
            pages = outcome.total_pages,
            new_data_files = outcome.new_data_files,
            reused_data_files = outcome.reused_data_files,
            marked,
            "checkpoint dumped"
        );
        Ok(outcome)
    }
}

fn remove_staged(files: &LocalCheckpointFiles) {
    for file in files
        .data_files
        .iter()
        .chain(std::iter::once(&files.manifest_file))
    {
        if let Err(err) = fs::remove_file(&file.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %file.path.display(), error = %err, "failed to remove staged checkpoint file");
            }
        }
    }
}

impl fmt::Debug for PageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStore")
            .field("store_id", &self.store_id)
            .field("path", &self.path)
            .finish()
    }
}
