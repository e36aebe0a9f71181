//! Remote object storage used to publish and fetch checkpoints.
//!
//! [`RemoteObjectStore`] is a small synchronous contract: restore jobs run on
//! blocking worker threads, so backends that are async underneath (S3) block
//! on their own runtime handle. [`MemoryObjectStore`] backs tests and
//! single-process setups.

mod memory;
mod s3_store;

use std::io;

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ErrorCode;

pub use memory::MemoryObjectStore;
pub use s3_store::{RemoteStoreConfig, S3ErrorCode, S3ObjectStore};

/// Errors surfaced by remote object store backends.
#[derive(Debug, Error)]
pub enum RemoteStoreError {
    /// Object (or bucket) does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Bucket already exists and belongs to the caller.
    #[error("bucket already owned by caller: {0}")]
    BucketAlreadyOwned(String),

    /// Bucket name is taken by another account.
    #[error("bucket name already taken: {0}")]
    BucketTaken(String),

    /// Service unreachable, throttling, or rejected credentials.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// S3 operation error not classified above.
    #[error("S3 error: {0}")]
    S3(#[from] ::s3::error::S3Error),

    /// Credentials error.
    #[error("credentials error: {0}")]
    Credentials(#[from] ::s3::creds::error::CredentialsError),

    /// I/O error while reading a staged file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}

impl RemoteStoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RemoteStoreError::NotFound(_) => ErrorCode::DataNotVisible,
            RemoteStoreError::Io(_) => ErrorCode::IoFailure,
            RemoteStoreError::Config(_) | RemoteStoreError::Credentials(_) => {
                ErrorCode::ConfigurationError
            }
            RemoteStoreError::BucketAlreadyOwned(_)
            | RemoteStoreError::BucketTaken(_)
            | RemoteStoreError::Unavailable(_)
            | RemoteStoreError::S3(_) => ErrorCode::RemoteFailure,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteStoreError::NotFound(_))
    }
}

/// Object store holding published checkpoint manifests and data files.
pub trait RemoteObjectStore: Send + Sync {
    /// Create `bucket`. Fails with [`RemoteStoreError::BucketAlreadyOwned`]
    /// when the caller already owns it.
    fn create_bucket(&self, bucket: &str) -> Result<(), RemoteStoreError>;

    fn put(&self, key: &str, data: &[u8]) -> Result<(), RemoteStoreError>;

    /// Fetch an object. Missing objects yield [`RemoteStoreError::NotFound`].
    fn get(&self, key: &str) -> Result<Vec<u8>, RemoteStoreError>;

    /// Keys under `prefix`, in lexicographic order.
    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteStoreError>;

    /// Idempotent bucket creation. Returns true when the bucket exists and
    /// is owned by the caller after the call.
    fn create_bucket_if_absent(&self, bucket: &str) -> bool {
        match self.create_bucket(bucket) {
            Ok(()) => {
                debug!(bucket, "bucket created");
                true
            }
            Err(RemoteStoreError::BucketAlreadyOwned(_)) => {
                debug!(bucket, "bucket already owned");
                true
            }
            Err(err) => {
                warn!(bucket, error = %err, code = %err.code(), "bucket creation failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_a_visibility_gap() {
        let err = RemoteStoreError::NotFound("s1/data/dat_1_0".into());
        assert_eq!(err.code(), ErrorCode::DataNotVisible);
        assert!(err.is_not_found());
        assert!(err.code().is_transient());
    }

    #[test]
    fn bucket_taken_is_not_success() {
        struct Taken;
        impl RemoteObjectStore for Taken {
            fn create_bucket(&self, bucket: &str) -> Result<(), RemoteStoreError> {
                Err(RemoteStoreError::BucketTaken(bucket.to_string()))
            }
            fn put(&self, _key: &str, _data: &[u8]) -> Result<(), RemoteStoreError> {
                Ok(())
            }
            fn get(&self, key: &str) -> Result<Vec<u8>, RemoteStoreError> {
                Err(RemoteStoreError::NotFound(key.to_string()))
            }
            fn list(&self, _prefix: &str) -> Result<Vec<String>, RemoteStoreError> {
                Ok(Vec::new())
            }
        }

        assert!(!Taken.create_bucket_if_absent("shared"));
    }
}
