//! Append-only room log.
//!
//! A room log is a sequence of frames, each a little-endian `u32` length
//! followed by that many bytes of CBOR-encoded [`LogRecord`]. The first
//! record of every log is [`LogRecord::Site`].
//!
//! A crash can leave a partial frame at the end of the file. Replay drops it
//! and truncates the file back to the last complete frame.

use crate::error::{StoreError, StoreResult};
use crsync_protocol::{Change, Schema, SiteId, Value};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the frame length prefix.
const FRAME_HEADER: u64 = 4;

/// Upper bound on a single record.
pub(crate) const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// A durable room mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum LogRecord {
    /// Site id assigned when the room was created.
    Site(SiteId),
    /// Schema recorded for the room.
    Schema(Schema),
    /// An accepted changeset.
    Apply {
        /// Peer that sent the batch.
        sender: SiteId,
        /// The batch, as received.
        changes: Vec<Change>,
    },
    /// A local write.
    Local {
        /// Table name.
        table: String,
        /// Encoded primary key.
        pk: Vec<u8>,
        /// Column name.
        cid: String,
        /// Written value.
        val: Value,
    },
}

impl LogRecord {
    fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

/// Records read back from a log.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    pub(crate) records: Vec<LogRecord>,
    /// Bytes of complete frames.
    pub(crate) valid_len: u64,
    /// Bytes of a trailing partial frame, if any.
    pub(crate) torn_len: u64,
}

/// An open room log file.
#[derive(Debug)]
pub(crate) struct RoomLog {
    path: PathBuf,
    file: File,
    size: u64,
}

impl RoomLog {
    /// Opens or creates the log at `path` for appending.
    pub(crate) fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(path, file)
    }

    /// Opens an existing log without write access.
    pub(crate) fn open_read_only(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(path, file)
    }

    fn from_file(path: &Path, file: File) -> StoreResult<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        if len == 0 {
            return Ok(buffer);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Reads every complete record.
    ///
    /// # Errors
    ///
    /// A complete frame that does not decode, or a frame longer than
    /// [`MAX_RECORD_SIZE`], is reported as [`StoreError::Corrupted`].
    pub(crate) fn read_all(&mut self) -> StoreResult<Replay> {
        let mut replay = Replay::default();
        let mut offset = 0u64;

        while offset < self.size {
            if self.size - offset < FRAME_HEADER {
                break;
            }
            let header = self.read_at(offset, FRAME_HEADER as usize)?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            if len > MAX_RECORD_SIZE {
                return Err(StoreError::Corrupted(format!(
                    "record at offset {offset} claims {len} bytes"
                )));
            }
            let body_start = offset + FRAME_HEADER;
            if self.size - body_start < u64::from(len) {
                break;
            }
            let body = self.read_at(body_start, len as usize)?;
            let record = LogRecord::decode(&body).map_err(|e| {
                StoreError::Corrupted(format!("record at offset {offset}: {e}"))
            })?;
            replay.records.push(record);
            offset = body_start + u64::from(len);
        }

        replay.valid_len = offset;
        replay.torn_len = self.size - offset;
        Ok(replay)
    }

    /// Appends a record and returns its offset.
    pub(crate) fn append(&mut self, record: &LogRecord) -> StoreResult<u64> {
        let body = record.encode()?;
        let len = u32::try_from(body.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_SIZE)
            .ok_or_else(|| StoreError::Codec(format!("record of {} bytes is too large", body.len())))?;

        let mut frame = Vec::with_capacity(body.len() + FRAME_HEADER as usize);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);

        let offset = self.size;
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&frame)?;
        self.size += frame.len() as u64;
        Ok(offset)
    }

    pub(crate) fn flush(&mut self) -> StoreResult<()> {
        self.file.flush()?;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub(crate) fn truncate(&mut self, new_size: u64) -> StoreResult<()> {
        if new_size > self.size {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to size {} which is greater than current size {}",
                    new_size, self.size
                ),
            )));
        }
        self.file.set_len(new_size)?;
        self.file.sync_all()?;
        self.size = new_size;
        Ok(())
    }
}
