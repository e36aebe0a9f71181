//! Region metadata records and the page ids they are persisted under.
//!
//! Raft-related records live in a `0x01` keyspace with a fixed-width
//! big-endian region id, so every (region, record kind) pair maps to a
//! distinct page id and ids of one region sort together. User data pages
//! are prefixed with `k_<cf>_` and can never collide with raft records.

use bincode::serde::{decode_from_slice, encode_to_vec};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::checkpoint::StoreId;
use crate::error::ErrorCode;
use crate::page_store::{PageId, WriteBatch};

pub type RegionId = u64;
pub type PeerId = u64;

const LOCAL_PREFIX: u8 = 0x01;
const REGION_RAFT_PREFIX: u8 = 0x02;
const REGION_META_PREFIX: u8 = 0x03;

const RAFT_LOG_SUFFIX: u8 = 0x01;
const RAFT_STATE_SUFFIX: u8 = 0x02;
const APPLY_STATE_SUFFIX: u8 = 0x03;
const REGION_STATE_SUFFIX: u8 = 0x01;

const DATA_PREFIX: &[u8] = b"k_";

#[derive(Debug, Error)]
pub enum RegionStateError {
    #[error("failed to encode region state: {0}")]
    Encode(String),
    #[error("failed to decode region state: {0}")]
    Decode(String),
    #[error("trailing bytes after region state: {0}")]
    TrailingBytes(usize),
}

impl RegionStateError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::DataCorruption
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    Voter,
    Learner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub store_id: StoreId,
    pub role: PeerRole,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMeta {
    pub id: RegionId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
}

impl RegionMeta {
    pub fn peer_on_store(&self, store_id: StoreId) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.store_id == store_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    #[default]
    Normal,
    Applying,
    Tombstone,
}

/// Durable description of a region as seen by one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLocalState {
    pub state: PeerState,
    pub region: RegionMeta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedState {
    pub index: u64,
    pub term: u64,
}

/// Replication progress of a region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyState {
    pub applied_index: u64,
    pub commit_index: u64,
    pub commit_term: u64,
    pub truncated_state: TruncatedState,
}

pub fn encode_state<T: Serialize>(state: &T) -> Result<Vec<u8>, RegionStateError> {
    encode_to_vec(state, bincode::config::standard())
        .map_err(|err| RegionStateError::Encode(err.to_string()))
}

pub fn decode_state<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RegionStateError> {
    let (state, len) = decode_from_slice(bytes, bincode::config::standard())
        .map_err(|err| RegionStateError::Decode(err.to_string()))?;
    if len != bytes.len() {
        return Err(RegionStateError::TrailingBytes(bytes.len() - len));
    }
    Ok(state)
}

fn region_key(prefix: u8, region_id: RegionId, suffix: u8) -> PageId {
    let mut key = Vec::with_capacity(11);
    key.push(LOCAL_PREFIX);
    key.push(prefix);
    key.extend_from_slice(&region_id.to_be_bytes());
    key.push(suffix);
    PageId::new(key)
}

pub fn apply_state_key(region_id: RegionId) -> PageId {
    region_key(REGION_RAFT_PREFIX, region_id, APPLY_STATE_SUFFIX)
}

pub fn raft_state_key(region_id: RegionId) -> PageId {
    region_key(REGION_RAFT_PREFIX, region_id, RAFT_STATE_SUFFIX)
}

pub fn region_local_state_key(region_id: RegionId) -> PageId {
    region_key(REGION_META_PREFIX, region_id, REGION_STATE_SUFFIX)
}

pub fn raft_log_key(region_id: RegionId, index: u64) -> PageId {
    let mut key = region_key(REGION_RAFT_PREFIX, region_id, RAFT_LOG_SUFFIX).into_bytes();
    key.extend_from_slice(&index.to_be_bytes());
    PageId::new(key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    Default,
    Write,
    Lock,
}

impl ColumnFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnFamily::Default => "default",
            ColumnFamily::Write => "write",
            ColumnFamily::Lock => "lock",
        }
    }
}

/// Page id of a user key in `cf`.
pub fn data_page_id(cf: ColumnFamily, key: &[u8]) -> PageId {
    let cf = cf.as_str().as_bytes();
    let mut id = Vec::with_capacity(DATA_PREFIX.len() + cf.len() + 1 + key.len());
    id.extend_from_slice(DATA_PREFIX);
    id.extend_from_slice(cf);
    id.push(b'_');
    id.extend_from_slice(key);
    PageId::new(id)
}

/// Batch persisting both region records, applied atomically by the page
/// store.
pub fn persist_region_meta(
    region_id: RegionId,
    apply: &ApplyState,
    local: &RegionLocalState,
) -> Result<WriteBatch, RegionStateError> {
    let mut batch = WriteBatch::new();
    batch.put(apply_state_key(region_id), encode_state(apply)?);
    batch.put(region_local_state_key(region_id), encode_state(local)?);
    Ok(batch)
}
