use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

use super::key::{DataFileId, DataFileIndex, KeyArgs, KeyTemplate, Sequence, StoreId};
use super::manifest::DataFileRecord;
use super::{CheckpointError, LocalCheckpointFile, crc64};

/// Packs page payloads into zstd-compressed data files and stages them on
/// local disk.
///
/// Pages are appended to an in-memory buffer; once the buffer reaches
/// `max_file_bytes` it is sealed and the next page starts a new file. A page
/// never spans two files.
pub(crate) struct DataFilePacker<'a> {
    store_id: StoreId,
    sequence: Sequence,
    next_index: DataFileIndex,
    max_file_bytes: u64,
    compression_level: i32,
    locator: &'a KeyTemplate,
    path: &'a KeyTemplate,
    buffer: Vec<u8>,
    sealed: Vec<(DataFileRecord, LocalCheckpointFile)>,
}

impl<'a> DataFilePacker<'a> {
    pub(crate) fn new(
        store_id: StoreId,
        sequence: Sequence,
        max_file_bytes: u64,
        compression_level: i32,
        locator: &'a KeyTemplate,
        path: &'a KeyTemplate,
    ) -> Self {
        Self {
            store_id,
            sequence,
            next_index: 0,
            max_file_bytes: max_file_bytes.max(1),
            compression_level,
            locator,
            path,
            buffer: Vec::new(),
            sealed: Vec::new(),
        }
    }

    /// Append `data`, returning the file it lands in and its offset there.
    pub(crate) fn push(&mut self, data: &[u8]) -> Result<(DataFileId, u64), CheckpointError> {
        if !self.buffer.is_empty()
            && self.buffer.len() as u64 + data.len() as u64 > self.max_file_bytes
        {
            self.seal()?;
        }
        let offset = self.buffer.len() as u64;
        self.buffer.extend_from_slice(data);
        Ok((DataFileId::new(self.sequence, self.next_index), offset))
    }

    fn seal(&mut self) -> Result<(), CheckpointError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let id = DataFileId::new(self.sequence, self.next_index);
        let args = KeyArgs::data_file(self.store_id, self.sequence, self.next_index);
        let key = self.locator.render(&args)?;
        let path = PathBuf::from(self.path.render(&args)?);

        let compressed = zstd::encode_all(self.buffer.as_slice(), self.compression_level)
            .map_err(|err| CheckpointError::Compression(err.to_string()))?;
        write_staged(&path, &compressed)?;
        trace!(
            file = %id,
            raw_bytes = self.buffer.len(),
            compressed_bytes = compressed.len(),
            "sealed checkpoint data file"
        );

        let record = DataFileRecord {
            id,
            key: key.clone(),
            compressed_bytes: compressed.len() as u64,
            raw_bytes: self.buffer.len() as u64,
            checksum: crc64(&compressed),
        };
        self.sealed.push((record, LocalCheckpointFile { path, key }));
        self.buffer.clear();
        self.next_index = self
            .next_index
            .checked_add(1)
            .ok_or(CheckpointError::IndexExhausted(self.sequence))?;
        Ok(())
    }

    pub(crate) fn finish(
        mut self,
    ) -> Result<Vec<(DataFileRecord, LocalCheckpointFile)>, CheckpointError> {
        self.seal()?;
        Ok(self.sealed)
    }
}

pub(crate) fn write_staged(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)
}
