//! Error codes shared across the fast-add-peer pipeline.
//!
//! Every module keeps its own `thiserror` enum; each of those exposes a
//! `code()` that maps onto [`ErrorCode`]. The restorer classifies failures by
//! code rather than by inspecting error messages.

use std::fmt;

/// Error codes for the major failure classes in bop-fap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Local I/O failed (staging files, resident cache, page store files).
    IoFailure,
    /// Local page store (LMDB) operation failed.
    StorageFailure,
    /// Remote object store call failed (network, auth, throttling).
    RemoteFailure,
    /// Listing the remote manifest namespace failed.
    CatalogUnavailable,
    /// An object the checkpoint references is not visible remotely yet.
    DataNotVisible,
    /// A manifest could not be decoded or is internally inconsistent.
    ManifestCorrupt,
    /// A data file failed checksum or decompression.
    DataCorruption,
    /// Invalid configuration or key template.
    ConfigurationError,
    /// A restore job panicked on a worker thread.
    WorkerPanic,
    /// Polling/scheduling contract misuse (duplicate schedule, early fetch).
    ConcurrencyViolation,
    /// Operation rejected because the component is shutting down.
    OperationCancelled,
}

impl ErrorCode {
    /// Returns a string identifier for this error code.
    ///
    /// Used as a structured field in log events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::IoFailure => "io_failure",
            ErrorCode::StorageFailure => "storage_failure",
            ErrorCode::RemoteFailure => "remote_failure",
            ErrorCode::CatalogUnavailable => "catalog_unavailable",
            ErrorCode::DataNotVisible => "data_not_visible",
            ErrorCode::ManifestCorrupt => "manifest_corrupt",
            ErrorCode::DataCorruption => "data_corruption",
            ErrorCode::ConfigurationError => "configuration_error",
            ErrorCode::WorkerPanic => "worker_panic",
            ErrorCode::ConcurrencyViolation => "concurrency_violation",
            ErrorCode::OperationCancelled => "operation_cancelled",
        }
    }

    /// True for failures that a later attempt can be expected to clear
    /// without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::RemoteFailure | ErrorCode::CatalogUnavailable | ErrorCode::DataNotVisible
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_as_str() {
        assert_eq!(ErrorCode::IoFailure.as_str(), "io_failure");
        assert_eq!(ErrorCode::DataNotVisible.as_str(), "data_not_visible");
        assert_eq!(ErrorCode::ManifestCorrupt.as_str(), "manifest_corrupt");
    }

    #[test]
    fn transient_codes() {
        assert!(ErrorCode::DataNotVisible.is_transient());
        assert!(ErrorCode::CatalogUnavailable.is_transient());
        assert!(!ErrorCode::ManifestCorrupt.is_transient());
        assert!(!ErrorCode::WorkerPanic.is_transient());
    }
}
