//! S3-compatible backend for [`RemoteObjectStore`] using rust-s3.
//!
//! Works with MinIO, AWS S3, or any S3-compatible service. rust-s3 is async;
//! calls block on the configured runtime handle, so they must be made from a
//! blocking context (a restore worker or a plain thread), never from inside
//! an async task.

use s3::BucketConfiguration;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use super::{RemoteObjectStore, RemoteStoreError};

/// Configuration for [`S3ObjectStore`].
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /// S3 bucket name.
    pub bucket: String,

    /// S3 region (e.g., "us-west-2").
    pub region: String,

    /// S3 endpoint URL (for MinIO: "http://localhost:9000", for AWS: None).
    pub endpoint: Option<String>,

    /// Access key ID.
    pub access_key: Option<String>,

    /// Secret access key.
    pub secret_key: Option<String>,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            bucket: "fast-add-peer".to_string(),
            region: "us-west-2".to_string(),
            endpoint: None,
            access_key: None,
            secret_key: None,
        }
    }
}

/// Error codes reported in S3 XML error bodies that the backend acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S3ErrorCode {
    NoSuchKey,
    NoSuchBucket,
    BucketAlreadyOwnedByYou,
    BucketAlreadyExists,
    AccessDenied,
    SlowDown,
    Other(String),
}

impl S3ErrorCode {
    /// Extract `<Code>` from an S3 error response body.
    pub fn from_body(body: &str) -> Option<Self> {
        let start = body.find("<Code>")? + "<Code>".len();
        let end = start + body[start..].find("</Code>")?;
        Some(Self::from_code(body[start..end].trim()))
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "NoSuchKey" => S3ErrorCode::NoSuchKey,
            "NoSuchBucket" => S3ErrorCode::NoSuchBucket,
            "BucketAlreadyOwnedByYou" => S3ErrorCode::BucketAlreadyOwnedByYou,
            "BucketAlreadyExists" => S3ErrorCode::BucketAlreadyExists,
            "AccessDenied" => S3ErrorCode::AccessDenied,
            "SlowDown" => S3ErrorCode::SlowDown,
            other => S3ErrorCode::Other(other.to_string()),
        }
    }
}

/// [`RemoteObjectStore`] over a single S3 bucket.
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
    region: Region,
    credentials: Credentials,
    config: RemoteStoreConfig,
    handle: Handle,
}

impl S3ObjectStore {
    /// Build a client for `config.bucket`. The bucket is not required to
    /// exist yet; see [`RemoteObjectStore::create_bucket_if_absent`].
    pub fn new(config: RemoteStoreConfig, handle: Handle) -> Result<Self, RemoteStoreError> {
        let region = if let Some(ref endpoint) = config.endpoint {
            Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            }
        } else {
            match config.region.as_str() {
                "us-east-1" => Region::UsEast1,
                "us-west-1" => Region::UsWest1,
                "us-west-2" => Region::UsWest2,
                "eu-west-1" => Region::EuWest1,
                "eu-central-1" => Region::EuCentral1,
                _ => {
                    return Err(RemoteStoreError::Config(format!(
                        "unsupported AWS region '{}'. Use endpoint for custom regions.",
                        config.region
                    )));
                }
            }
        };

        let credentials = if let (Some(access_key), Some(secret_key)) =
            (&config.access_key, &config.secret_key)
        {
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)?
        } else {
            // AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY
            Credentials::default()?
        };

        let mut bucket = Bucket::new(&config.bucket, region.clone(), credentials.clone())?;
        if path_style(&config) {
            bucket = bucket.with_path_style();
        }

        Ok(Self {
            bucket,
            region,
            credentials,
            config,
            handle,
        })
    }

    pub fn config(&self) -> &RemoteStoreConfig {
        &self.config
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.config.bucket)
            .field("endpoint", &self.config.endpoint)
            .finish()
    }
}

impl RemoteObjectStore for S3ObjectStore {
    fn create_bucket(&self, bucket: &str) -> Result<(), RemoteStoreError> {
        let region = self.region.clone();
        let credentials = self.credentials.clone();
        let config = BucketConfiguration::default();
        let response = if path_style(&self.config) {
            self.handle.block_on(Bucket::create_with_path_style(
                bucket,
                region,
                credentials,
                config,
            ))
        } else {
            self.handle
                .block_on(Bucket::create(bucket, region, credentials, config))
        }
        .map_err(|err| classify(bucket, err))?;
        if response.success() {
            debug!(bucket, "created bucket");
            return Ok(());
        }
        Err(classify_status(
            bucket,
            response.response_code,
            &response.response_text,
        ))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), RemoteStoreError> {
        trace!(key, bytes = data.len(), "put object");
        let response = self
            .handle
            .block_on(self.bucket.put_object(key, data))
            .map_err(|err| classify(key, err))?;
        check_status(key, response.status_code(), response.as_str().unwrap_or(""))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, RemoteStoreError> {
        trace!(key, "get object");
        let response = self
            .handle
            .block_on(self.bucket.get_object(key))
            .map_err(|err| classify(key, err))?;
        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(classify_status(
                key,
                status,
                &String::from_utf8_lossy(response.bytes()),
            ));
        }
        Ok(response.bytes().to_vec())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteStoreError> {
        trace!(prefix, "list objects");
        let pages = self
            .handle
            .block_on(self.bucket.list(prefix.to_string(), None))
            .map_err(|err| classify(prefix, err))?;
        let mut keys: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.contents.into_iter().map(|object| object.key))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Custom endpoints (MinIO and friends) are addressed path style; AWS uses
/// virtual-hosted buckets.
fn path_style(config: &RemoteStoreConfig) -> bool {
    config.endpoint.is_some()
}

fn check_status(subject: &str, status: u16, body: &str) -> Result<(), RemoteStoreError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(classify_status(subject, status, body))
    }
}

fn classify(subject: &str, err: S3Error) -> RemoteStoreError {
    match err {
        S3Error::HttpFailWithBody(status, body) => classify_status(subject, status, &body),
        other => RemoteStoreError::S3(other),
    }
}

fn classify_status(subject: &str, status: u16, body: &str) -> RemoteStoreError {
    let code = S3ErrorCode::from_body(body);
    match (status, code) {
        (_, Some(S3ErrorCode::BucketAlreadyOwnedByYou)) => {
            RemoteStoreError::BucketAlreadyOwned(subject.to_string())
        }
        (_, Some(S3ErrorCode::BucketAlreadyExists)) => {
            RemoteStoreError::BucketTaken(subject.to_string())
        }
        (_, Some(S3ErrorCode::NoSuchKey | S3ErrorCode::NoSuchBucket)) | (404, _) => {
            RemoteStoreError::NotFound(subject.to_string())
        }
        (409, _) => RemoteStoreError::BucketTaken(subject.to_string()),
        (401 | 403 | 429, _) | (500..=599, _) => {
            RemoteStoreError::Unavailable(format!("{subject}: HTTP {status}"))
        }
        (_, code) => RemoteStoreError::Unavailable(format!(
            "{subject}: HTTP {status} ({})",
            match code {
                Some(S3ErrorCode::Other(code)) => code,
                Some(code) => format!("{code:?}"),
                None => "no error code".to_string(),
            }
        )),
    }
}
