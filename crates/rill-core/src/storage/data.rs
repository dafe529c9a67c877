//! Segmented change-event log keyed by [`Sequence`]
//!
//! ```text
//! <database>/data/
//!   00000000000000000000.data
//!   00000000000000000001.data
//! ```
//!
//! A segment is closed once it reaches `max_segment_size`; the writer never
//! appends to a segment after creating its successor, so a reader that finds
//! a successor may treat the current segment as complete.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::frame::{read_at, FrameWriter};
use super::LifeCycle;
use crate::{ChangeEvent, Error, Result, Sequence};

const DATA_DIR: &str = "data";
const DATA_SUFFIX: &str = "data";

/// Data-layer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataKey(pub Sequence);

impl DataKey {
    pub fn new(sequence: Sequence) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> Sequence {
        self.0
    }
}

/// One stored record together with the position of the record after it.
#[derive(Debug, Clone, PartialEq)]
pub struct DataValue {
    event: ChangeEvent,
    sequence: Sequence,
    next: Sequence,
}

impl DataValue {
    pub fn event(&self) -> &ChangeEvent {
        &self.event
    }

    pub fn into_event(self) -> ChangeEvent {
        self.event
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn next_sequence(&self) -> Sequence {
        self.next
    }
}

pub(crate) fn data_dir(database_dir: &Path) -> PathBuf {
    database_dir.join(DATA_DIR)
}

fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", segment, DATA_SUFFIX))
}

fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut segments: Vec<u64> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == DATA_SUFFIX))
        .filter_map(|path| path.file_stem()?.to_str()?.parse::<u64>().ok())
        .collect();
    segments.sort_unstable();
    Ok(segments)
}

/// Append side of the data log.
#[derive(Debug)]
pub struct WriteDataManager {
    database: String,
    dir: PathBuf,
    max_segment_size: u64,
    fsync: bool,
    active: Option<(u64, FrameWriter)>,
}

impl WriteDataManager {
    pub fn new(
        database: impl Into<String>,
        database_dir: &Path,
        max_segment_size: u64,
        fsync: bool,
    ) -> Self {
        Self {
            database: database.into(),
            dir: data_dir(database_dir),
            max_segment_size,
            fsync,
            active: None,
        }
    }

    /// Append an event; returns the sequence it was stored at.
    pub fn append(&mut self, event: &ChangeEvent) -> Result<Sequence> {
        let (segment, writer) = self.active.as_mut().ok_or_else(|| {
            Error::invalid_state(format!("data writer for {} is not started", self.database))
        })?;

        if writer.size() >= self.max_segment_size {
            writer.flush(self.fsync)?;
            let next = *segment + 1;
            debug!(
                database = %self.database,
                segment = next,
                "Rolling data segment"
            );
            *writer = FrameWriter::open(segment_path(&self.dir, next))?;
            *segment = next;
        }

        let offset = writer.append(event)?;
        Ok(Sequence::new(*segment, offset))
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some((_, writer)) = self.active.as_mut() {
            writer.flush(self.fsync)?;
        }
        Ok(())
    }
}

impl LifeCycle for WriteDataManager {
    fn start(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let segment = list_segments(&self.dir)?.last().copied().unwrap_or(0);
        let writer = FrameWriter::open(segment_path(&self.dir, segment))?;
        debug!(
            database = %self.database,
            segment,
            size = writer.size(),
            path = %writer.path().display(),
            "Opened data segment for append"
        );
        self.active = Some((segment, writer));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.flush()?;
        self.active = None;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.active.is_some()
    }
}

#[derive(Debug)]
struct Cursor {
    sequence: Sequence,
    path: PathBuf,
    file: File,
}

impl Cursor {
    fn open(dir: &Path, sequence: Sequence) -> Result<Option<Self>> {
        let path = segment_path(dir, sequence.segment());
        match File::open(&path) {
            Ok(file) => Ok(Some(Self {
                sequence,
                path,
                file,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sequential reader over the data log.
#[derive(Debug)]
pub struct ReadDataManager {
    database: String,
    dir: PathBuf,
    started: bool,
    cursor: Option<Cursor>,
}

impl ReadDataManager {
    pub fn new(database: impl Into<String>, database_dir: &Path) -> Self {
        Self {
            database: database.into(),
            dir: data_dir(database_dir),
            started: false,
            cursor: None,
        }
    }

    /// Position the reader so that the next [`next`](Self::next) returns the
    /// record stored at `key`.
    pub fn open(&mut self, key: DataKey) -> Result<()> {
        if !self.started {
            return Err(Error::invalid_state(format!(
                "data reader for {} is not started",
                self.database
            )));
        }
        let cursor = Cursor::open(&self.dir, key.sequence())?.ok_or_else(|| {
            Error::not_found(format!(
                "segment for sequence {} of {}",
                key.sequence(),
                self.database
            ))
        })?;
        self.cursor = Some(cursor);
        Ok(())
    }

    /// Read the record at the cursor and advance past it.
    ///
    /// Returns [`Error::EndOfStream`] when nothing further has been written
    /// yet; calling again later picks up new records.
    pub fn next(&mut self) -> Result<DataValue> {
        let cursor = self.cursor.as_mut().ok_or_else(|| {
            Error::invalid_state(format!("data reader for {} is not opened", self.database))
        })?;

        loop {
            let sequence = cursor.sequence;
            if let Some((event, len)) =
                read_at::<ChangeEvent>(&mut cursor.file, &cursor.path, sequence.offset())?
            {
                let next = sequence.advance(len);
                cursor.sequence = next;
                return Ok(DataValue {
                    event,
                    sequence,
                    next,
                });
            }

            let successor = sequence.next_segment();
            match Cursor::open(&self.dir, successor)? {
                Some(next_cursor) => {
                    let len = cursor.file.metadata()?.len();
                    if sequence.offset() < len {
                        warn!(
                            database = %self.database,
                            sequence = %sequence,
                            segment_len = len,
                            "Skipping truncated tail of closed segment"
                        );
                    }
                    *cursor = next_cursor;
                }
                None => return Err(Error::EndOfStream),
            }
        }
    }
}

impl LifeCycle for ReadDataManager {
    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.cursor = None;
        self.started = false;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }
}
