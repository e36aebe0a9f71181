use std::fmt;

use crate::region::{ApplyState, RegionLocalState, RegionStateError, decode_state};

/// Outcome class of a fast-add-peer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FastAddPeerStatus {
    Ok,
    /// No usable checkpoint is visible yet; retry later.
    WaitForData,
    /// The owning store or the region's state could not be found.
    NoSuitableCheckpoint,
    /// Persisted region state exists but cannot be decoded.
    BadData,
    Failed,
}

impl FastAddPeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FastAddPeerStatus::Ok => "ok",
            FastAddPeerStatus::WaitForData => "wait_for_data",
            FastAddPeerStatus::NoSuitableCheckpoint => "no_suitable_checkpoint",
            FastAddPeerStatus::BadData => "bad_data",
            FastAddPeerStatus::Failed => "failed",
        }
    }

    /// Callers fall back to a regular snapshot on these.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            FastAddPeerStatus::BadData | FastAddPeerStatus::Failed
        )
    }
}

impl fmt::Display for FastAddPeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one restore task. State bytes are only populated on `Ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastAddPeerResult {
    pub status: FastAddPeerStatus,
    pub apply_state: Vec<u8>,
    pub local_state: Vec<u8>,
}

impl FastAddPeerResult {
    pub fn ok(apply_state: Vec<u8>, local_state: Vec<u8>) -> Self {
        Self {
            status: FastAddPeerStatus::Ok,
            apply_state,
            local_state,
        }
    }

    pub fn with_status(status: FastAddPeerStatus) -> Self {
        Self {
            status,
            apply_state: Vec::new(),
            local_state: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == FastAddPeerStatus::Ok
    }

    pub fn decode_apply_state(&self) -> Result<ApplyState, RegionStateError> {
        decode_state(&self.apply_state)
    }

    pub fn decode_local_state(&self) -> Result<RegionLocalState, RegionStateError> {
        decode_state(&self.local_state)
    }
}
