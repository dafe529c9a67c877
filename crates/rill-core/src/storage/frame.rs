//! CRC-framed append-only record files
//!
//! Frame layout: `[CRC: 4][Len: 4][Payload: N]`, big-endian, payload is
//! bincode. A frame that is only partially on disk reads as "not yet
//! available"; a complete frame whose CRC does not match is corruption.

use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{Error, Result};

pub(crate) const FRAME_HEADER_SIZE: u64 = 8;

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<BytesMut> {
    let payload = bincode::serialize(value)?;

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
    frame.put_u32(crc);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame)
}

/// Read and CRC-check the raw payload of the frame starting at `position`.
fn read_payload(file: &mut File, path: &Path, position: u64) -> Result<Option<(Vec<u8>, u64)>> {
    let file_len = file.metadata()?.len();
    if position + FRAME_HEADER_SIZE > file_len {
        return Ok(None);
    }

    file.seek(SeekFrom::Start(position))?;
    let mut header = [0u8; FRAME_HEADER_SIZE as usize];
    file.read_exact(&mut header)?;

    let stored_crc = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as u64;

    if position + FRAME_HEADER_SIZE + len > file_len {
        return Ok(None); // incomplete frame
    }

    let mut payload = vec![0u8; len as usize];
    match file.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != stored_crc {
        return Err(Error::corrupted(
            format!("{}@{}", path.display(), position),
            "CRC mismatch",
        ));
    }

    Ok(Some((payload, FRAME_HEADER_SIZE + len)))
}

/// Read the frame starting at `position`.
///
/// Returns the decoded value and the total frame length, or `None` when the
/// file does not (yet) hold a complete frame at that position.
pub(crate) fn read_at<T: DeserializeOwned>(
    file: &mut File,
    path: &Path,
    position: u64,
) -> Result<Option<(T, u64)>> {
    match read_payload(file, path, position)? {
        Some((payload, len)) => Ok(Some((bincode::deserialize(&payload)?, len))),
        None => Ok(None),
    }
}

/// Byte length of the complete frames at the start of `file`.
fn complete_len(file: &mut File, path: &Path) -> Result<u64> {
    let mut position = 0;
    while let Some((_, len)) = read_payload(file, path, position)? {
        position += len;
    }
    Ok(position)
}

/// Appending side of a framed record file. Opening it drops a torn frame
/// left at the end of the file.
#[derive(Debug)]
pub(crate) struct FrameWriter {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FrameWriter {
    pub(crate) fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;
        let physical = file.metadata()?.len();
        let size = complete_len(&mut file, &path)?;
        if size < physical {
            // A crash mid-append leaves a torn frame that would hide every
            // record written after it.
            warn!(
                path = %path.display(),
                valid_len = size,
                file_len = physical,
                "Truncating incomplete trailing frame"
            );
            file.set_len(size)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;
        Ok(Self { path, file, size })
    }

    /// Append one record; returns the byte position it was written at.
    pub(crate) fn append<T: Serialize>(&mut self, value: &T) -> Result<u64> {
        let frame = encode(value)?;
        self.file.write_all(&frame)?;
        let position = self.size;
        self.size += frame.len() as u64;
        Ok(position)
    }

    pub(crate) fn flush(&mut self, fsync: bool) -> Result<()> {
        self.file.flush()?;
        if fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Follows a framed record file from a byte position, picking up records
/// appended by a concurrent writer on each call.
#[derive(Debug)]
pub(crate) struct FrameTail<T> {
    path: PathBuf,
    file: Option<File>,
    position: u64,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> FrameTail<T> {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            position: 0,
            _record: PhantomData,
        }
    }

    /// Read every complete record appended since the last call.
    pub(crate) fn read_new(&mut self) -> Result<Vec<T>> {
        if self.file.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            }
        }

        let mut records = Vec::new();
        if let Some(file) = self.file.as_mut() {
            while let Some((record, len)) = read_at::<T>(file, &self.path, self.position)? {
                records.push(record);
                self.position += len;
            }
        }
        Ok(records)
    }
}
