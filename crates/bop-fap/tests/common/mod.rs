#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use bop_fap::region::{
    ApplyState, ColumnFamily, Peer, PeerRole, PeerState, RegionEpoch, RegionId, RegionLocalState,
    RegionMeta, TruncatedState, data_page_id, persist_region_meta,
};
use bop_fap::{
    CheckpointUploader, DumpCheckpointOptions, DumpCheckpointOutcome, MemoryObjectStore,
    PageStore, PageStoreOptions, PersistCheckpoint, RemoteObjectStore, RemoteStoreError, StoreId,
    WriteBatch,
};
use tempfile::TempDir;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCmdType {
    Put,
    Del,
}

/// Region replica driven by hand: applies raft entries to a page store and
/// persists its metadata the way an apply loop would.
#[derive(Debug)]
pub struct MockRegion {
    pub apply_state: ApplyState,
    pub local_state: RegionLocalState,
    pending: WriteBatch,
}

impl MockRegion {
    /// Single-voter region hosted on `store_id`.
    pub fn bootstrap(region_id: RegionId, store_id: StoreId, peer_id: u64) -> Self {
        let truncated = TruncatedState { index: 5, term: 5 };
        Self {
            apply_state: ApplyState {
                applied_index: truncated.index,
                commit_index: truncated.index,
                commit_term: truncated.term,
                truncated_state: truncated,
            },
            local_state: RegionLocalState {
                state: PeerState::Normal,
                region: RegionMeta {
                    id: region_id,
                    start_key: Vec::new(),
                    end_key: Vec::new(),
                    epoch: RegionEpoch {
                        conf_ver: 1,
                        version: 1,
                    },
                    peers: vec![Peer {
                        id: peer_id,
                        store_id,
                        role: PeerRole::Voter,
                    }],
                },
            },
            pending: WriteBatch::new(),
        }
    }

    pub fn region_id(&self) -> RegionId {
        self.local_state.region.id
    }

    pub fn add_learner_peer(&mut self, peer_id: u64, store_id: StoreId) {
        let region = &mut self.local_state.region;
        region.peers.push(Peer {
            id: peer_id,
            store_id,
            role: PeerRole::Learner,
        });
        region.epoch.conf_ver += 1;
        self.advance(self.apply_state.commit_term);
    }

    /// Apply one raft entry carrying a batch of KV commands.
    pub fn normal_write(
        &mut self,
        term: u64,
        keys: &[u64],
        values: &[&str],
        cmds: &[WriteCmdType],
        cfs: &[ColumnFamily],
    ) {
        assert_eq!(keys.len(), values.len());
        assert_eq!(keys.len(), cmds.len());
        assert_eq!(keys.len(), cfs.len());
        for (((key, value), cmd), cf) in keys.iter().zip(values).zip(cmds).zip(cfs) {
            let page = data_page_id(*cf, key.to_string().as_bytes());
            match cmd {
                WriteCmdType::Put => {
                    self.pending.put(page, value.as_bytes().to_vec());
                }
                WriteCmdType::Del => {
                    self.pending.delete(page);
                }
            }
        }
        self.advance(term);
    }

    fn advance(&mut self, term: u64) {
        self.apply_state.applied_index += 1;
        self.apply_state.commit_index = self.apply_state.applied_index;
        self.apply_state.commit_term = term;
    }

    pub fn needs_flush(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Write pending data and the region records in one batch.
    pub fn try_flush(&mut self, store: &PageStore) -> bool {
        let mut batch = std::mem::take(&mut self.pending);
        match persist_region_meta(self.region_id(), &self.apply_state, &self.local_state) {
            Ok(meta) => batch.merge(meta),
            Err(_) => return false,
        }
        store.write(batch, None).is_ok()
    }

    pub fn persist_meta(&self, store: &PageStore) {
        let batch = persist_region_meta(self.region_id(), &self.apply_state, &self.local_state)
            .expect("encode region meta");
        store.write(batch, None).expect("persist region meta");
    }
}

/// Page store of one producing store plus a staging dir for dumps.
pub struct ProducerStore {
    pub store: PageStore,
    pub remote: Arc<MemoryObjectStore>,
    staging: PathBuf,
    _dir: TempDir,
}

impl ProducerStore {
    pub fn open(store_id: StoreId, remote: Arc<MemoryObjectStore>) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = PageStore::open(dir.path().join("pages"), store_id, PageStoreOptions::default())
            .expect("open page store");
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).expect("staging dir");
        Self {
            store,
            remote,
            staging,
            _dir: dir,
        }
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    pub fn dump(&self, sequence: u64) -> DumpCheckpointOutcome {
        let persist: Arc<dyn PersistCheckpoint> =
            Arc::new(CheckpointUploader::new(self.remote.clone()));
        let options = DumpCheckpointOptions::new(self.store.store_id(), &self.staging, persist)
            .with_override_sequence(sequence);
        self.store
            .dump_incremental_checkpoint(&options)
            .expect("dump checkpoint")
    }
}

/// Remote store whose every call fails as if the network were down.
pub struct OfflineStore;

impl RemoteObjectStore for OfflineStore {
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
