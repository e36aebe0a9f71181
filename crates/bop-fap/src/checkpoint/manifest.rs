//! Checkpoint manifest file format.
//!
//! ```text
//! +------+---------+-----------+----------------------+
//! | BFAP | version | body crc  | bincode(manifest)    |
//! | 4 B  | u16 LE  | u64 LE    | ...                  |
//! +------+---------+-----------+----------------------+
//! ```
//!
//! A manifest lists every page of the store at its sequence, either inline
//! or as a range inside a zstd-compressed data file.

use std::collections::{BTreeSet, HashMap};

use bincode::serde::{decode_from_slice, encode_to_vec};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::crc64;
use super::key::{DataFileId, KeyTemplate, ManifestKey, Sequence, StoreId};
use crate::error::ErrorCode;
use crate::page_store::PageId;

pub const MANIFEST_MAGIC: [u8; 4] = *b"BFAP";
pub const MANIFEST_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 8;

#[derive(Debug, Error)]
pub enum ManifestDecodeError {
    #[error("manifest truncated: {0} bytes")]
    TooShort(usize),
    #[error("bad manifest magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u16),
    #[error("manifest checksum mismatch: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch { expected: u64, actual: u64 },
    #[error("manifest body: {0}")]
    Body(String),
    #[error("invalid manifest: {0}")]
    Invalid(String),
}

impl ManifestDecodeError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ManifestCorrupt
    }
}

/// Identifies the process that produced a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterInfo {
    pub store_id: StoreId,
    pub instance_id: Uuid,
    pub host: String,
    pub build_version: String,
    pub created_at_epoch_ms: u64,
}

impl WriterInfo {
    pub fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            instance_id: Uuid::new_v4(),
            host: std::env::var("HOSTNAME").unwrap_or_default(),
            build_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at_epoch_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileRecord {
    pub id: DataFileId,
    /// Remote object key.
    pub key: String,
    pub compressed_bytes: u64,
    pub raw_bytes: u64,
    /// CRC64-NVME of the compressed object.
    pub checksum: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageLocation {
    Inline(Vec<u8>),
    /// Byte range within the decompressed data file.
    DataFile {
        file: DataFileId,
        offset: u64,
        size: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    pub id: PageId,
    pub location: PageLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub store_id: StoreId,
    pub sequence: Sequence,
    pub writer_info: WriterInfo,
    pub data_locator_pattern: KeyTemplate,
    /// Remote objects this checkpoint depends on. Includes every referenced
    /// data file.
    pub locked_files: BTreeSet<String>,
    pub data_files: Vec<DataFileRecord>,
    /// Sorted by page id.
    pub pages: Vec<PageEntry>,
}

impl CheckpointManifest {
    pub fn key(&self) -> ManifestKey {
        ManifestKey::new(self.store_id, self.sequence)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ManifestDecodeError> {
        let body = encode_to_vec(self, bincode::config::standard())
            .map_err(|err| ManifestDecodeError::Body(err.to_string()))?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&MANIFEST_MAGIC);
        out.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        out.extend_from_slice(&crc64(&body).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode and validate a manifest file.
    pub fn decode(bytes: &[u8]) -> Result<Self, ManifestDecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(ManifestDecodeError::TooShort(bytes.len()));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        if magic != MANIFEST_MAGIC {
            return Err(ManifestDecodeError::BadMagic(magic));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != MANIFEST_VERSION {
            return Err(ManifestDecodeError::UnsupportedVersion(version));
        }
        let mut crc = [0u8; 8];
        crc.copy_from_slice(&bytes[6..HEADER_LEN]);
        let expected = u64::from_le_bytes(crc);
        let body = &bytes[HEADER_LEN..];
        let actual = crc64(body);
        if expected != actual {
            return Err(ManifestDecodeError::ChecksumMismatch { expected, actual });
        }

        let (manifest, len): (Self, usize) =
            decode_from_slice(body, bincode::config::standard())
                .map_err(|err| ManifestDecodeError::Body(err.to_string()))?;
        if len != body.len() {
            return Err(ManifestDecodeError::Body(format!(
                "{} trailing bytes",
                body.len() - len
            )));
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural checks that do not need the data files themselves.
    pub fn validate(&self) -> Result<(), ManifestDecodeError> {
        let mut files = HashMap::with_capacity(self.data_files.len());
        for file in &self.data_files {
            if files.insert(file.id, file).is_some() {
                return Err(ManifestDecodeError::Invalid(format!(
                    "data file {} listed twice",
                    file.id
                )));
            }
            if !self.locked_files.contains(&file.key) {
                return Err(ManifestDecodeError::Invalid(format!(
                    "data file {} not in locked files",
                    file.key
                )));
            }
        }

        for pair in self.pages.windows(2) {
            if pair[0].id >= pair[1].id {
                return Err(ManifestDecodeError::Invalid(format!(
                    "page ids out of order at {:?}",
                    pair[1].id
                )));
            }
        }

        for page in &self.pages {
            if let PageLocation::DataFile { file, offset, size } = &page.location {
                let record = files.get(file).ok_or_else(|| {
                    ManifestDecodeError::Invalid(format!(
                        "page {:?} references unknown data file {}",
                        page.id, file
                    ))
                })?;
                let end = offset.checked_add(*size).ok_or_else(|| {
                    ManifestDecodeError::Invalid(format!("page {:?} range overflows", page.id))
                })?;
                if end > record.raw_bytes {
                    return Err(ManifestDecodeError::Invalid(format!(
                        "page {:?} range {}..{} beyond data file {} ({} bytes)",
                        page.id, offset, end, file, record.raw_bytes
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> CheckpointManifest {
        let file = DataFileId::new(1000, 0);
        let key = "s0000000000000001/data/dat_00000000000003e8_00000000".to_string();
        CheckpointManifest {
            store_id: 1,
            sequence: 1000,
            writer_info: WriterInfo::new(1),
            data_locator_pattern: KeyTemplate::default_data_file(),
            locked_files: [key.clone()].into_iter().collect(),
            data_files: vec![DataFileRecord {
                id: file,
                key,
                compressed_bytes: 10,
                raw_bytes: 64,
                checksum: 7,
            }],
            pages: vec![
                PageEntry {
                    id: PageId::new(b"a".to_vec()),
                    location: PageLocation::Inline(b"small".to_vec()),
                },
                PageEntry {
                    id: PageId::new(b"b".to_vec()),
                    location: PageLocation::DataFile {
                        file,
                        offset: 0,
                        size: 64,
                    },
                },
            ],
        }
    }

    #[test]
    fn encode_decode_preserves_manifest() {
        let manifest = manifest();
        let bytes = manifest.encode().unwrap();
        assert_eq!(&bytes[..4], b"BFAP");
        let decoded = CheckpointManifest::decode(&bytes).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.key(), ManifestKey::new(1, 1000));
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let mut bytes = manifest().encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = CheckpointManifest::decode(&bytes).unwrap_err();
        assert!(matches!(err, ManifestDecodeError::ChecksumMismatch { .. }));
        assert_eq!(err.code(), ErrorCode::ManifestCorrupt);
    }

    #[test]
    fn header_checks() {
        assert!(matches!(
            CheckpointManifest::decode(b"BFAP"),
            Err(ManifestDecodeError::TooShort(4))
        ));
        let mut bytes = manifest().encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            CheckpointManifest::decode(&bytes),
            Err(ManifestDecodeError::BadMagic(_))
        ));
        let mut bytes = manifest().encode().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            CheckpointManifest::decode(&bytes),
            Err(ManifestDecodeError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn validate_rejects_dangling_and_out_of_range_pages() {
        let mut dangling = manifest();
        dangling.pages[1].location = PageLocation::DataFile {
            file: DataFileId::new(999, 3),
            offset: 0,
            size: 1,
        };
        assert!(matches!(
            dangling.validate(),
            Err(ManifestDecodeError::Invalid(_))
        ));

        let mut overflow = manifest();
        overflow.pages[1].location = PageLocation::DataFile {
            file: DataFileId::new(1000, 0),
            offset: 60,
            size: 8,
        };
        assert!(overflow.validate().is_err());

        let mut unlocked = manifest();
        unlocked.locked_files.clear();
        assert!(unlocked.validate().is_err());

        let mut unordered = manifest();
        unordered.pages.reverse();
        assert!(unordered.validate().is_err());
    }
}
