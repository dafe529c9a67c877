//! Read and write channels over one database's storage
//!
//! A read channel composes the index reader and the data reader into a single
//! cursor: resolve a logical position to a sequence, then iterate records in
//! sequence order. It is read-only and independent of any writer's lifecycle.

use std::path::PathBuf;
use std::time::Duration;
use tracing::trace;

use super::data::{DataKey, ReadDataManager, WriteDataManager};
use super::index::{L1IndexKey, L2IndexValue, ReadIndexManager, WriteIndexManager};
use super::manager::WriterLease;
use super::LifeCycle;
use crate::{BinlogInfo, ChangeEvent, Error, Result, Sequence};

/// Where a read channel starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenPosition {
    Oldest,
    Latest,
    At(BinlogInfo),
}

/// Single-database, single-reader cursor over stored change events.
pub trait ReadChannel: LifeCycle + Send {
    /// Position at the globally first indexed event.
    fn open_oldest(&mut self) -> Result<()>;

    /// Position at the globally last indexed event.
    fn open_latest(&mut self) -> Result<()>;

    /// Position at the event recorded for `binlog_info` (exact match). With
    /// `skip_to_next_pos` set, the cursor starts one event past it.
    fn open(&mut self, binlog_info: &BinlogInfo) -> Result<()>;

    /// Next event in sequence order, or [`Error::EndOfStream`] if none has
    /// been written yet.
    fn next(&mut self) -> Result<ChangeEvent>;

    fn open_at(&mut self, position: &OpenPosition) -> Result<()> {
        match position {
            OpenPosition::Oldest => self.open_oldest(),
            OpenPosition::Latest => self.open_latest(),
            OpenPosition::At(binlog_info) => self.open(binlog_info),
        }
    }
}

/// Wait for the next event, sleeping `interval` whenever the channel is
/// drained. Wrap in `tokio::time::timeout` to bound the wait.
pub async fn poll_next<C>(channel: &mut C, interval: Duration) -> Result<ChangeEvent>
where
    C: ReadChannel + ?Sized,
{
    loop {
        match channel.next() {
            Err(Error::EndOfStream) => tokio::time::sleep(interval).await,
            other => return other,
        }
    }
}

#[derive(Debug)]
struct Readers {
    index: ReadIndexManager,
    data: ReadDataManager,
}

#[derive(Debug)]
pub struct DefaultReadChannel {
    database: String,
    database_dir: PathBuf,
    readers: Option<Readers>,
}

impl DefaultReadChannel {
    pub fn new(database: impl Into<String>, database_dir: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            database_dir: database_dir.into(),
            readers: None,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn readers(&mut self) -> Result<&mut Readers> {
        self.readers.as_mut().ok_or_else(|| {
            Error::invalid_state(format!("read channel for {} is not started", self.database))
        })
    }

    fn open_resolved(&mut self, what: &str, value: Option<L2IndexValue>) -> Result<()> {
        let database = self.database.clone();
        let value = value.ok_or_else(|| {
            Error::not_found(format!("failed to open {} of {}", what, database))
        })?;
        trace!(database = %database, sequence = %value.sequence(), "Opening read channel");
        self.readers()?.data.open(DataKey::new(value.sequence()))
    }
}

impl LifeCycle for DefaultReadChannel {
    fn start(&mut self) -> Result<()> {
        let mut index = ReadIndexManager::new(self.database.clone(), &self.database_dir);
        index.start()?;

        let mut data = ReadDataManager::new(self.database.clone(), &self.database_dir);
        data.start()?;

        self.readers = Some(Readers { index, data });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut readers) = self.readers.take() {
            readers.index.stop()?;
            readers.data.stop()?;
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.readers.is_some()
    }
}

impl ReadChannel for DefaultReadChannel {
    fn open_oldest(&mut self) -> Result<()> {
        let value = self.readers()?.index.find_oldest()?;
        self.open_resolved("oldest", value)
    }

    fn open_latest(&mut self) -> Result<()> {
        let value = self.readers()?.index.find_latest()?;
        self.open_resolved("latest", value)
    }

    fn open(&mut self, binlog_info: &BinlogInfo) -> Result<()> {
        let value = self.readers()?.index.find(&L1IndexKey::from(binlog_info))?;
        self.open_resolved(&binlog_info.to_string(), value)?;
        if binlog_info.skip_to_next_pos() {
            self.readers()?.data.next()?;
        }
        Ok(())
    }

    fn next(&mut self) -> Result<ChangeEvent> {
        Ok(self.readers()?.data.next()?.into_event())
    }
}

/// Executor-side channel: appends events and indexes their positions.
///
/// Holds the database's writer lease for as long as it lives.
#[derive(Debug)]
pub struct WriteChannel {
    database: String,
    index: WriteIndexManager,
    data: WriteDataManager,
    _lease: WriterLease,
}

impl WriteChannel {
    pub(crate) fn new(
        database: String,
        index: WriteIndexManager,
        data: WriteDataManager,
        lease: WriterLease,
    ) -> Self {
        Self {
            database,
            index,
            data,
            _lease: lease,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Store `event` and index its binlog position. Data is written before
    /// the index entry, so any indexed position is readable.
    pub fn write(&mut self, event: &ChangeEvent) -> Result<Sequence> {
        let sequence = self.data.append(event)?;
        let key = L1IndexKey::from(&event.binlog_info);
        if !self.index.append(&key, L2IndexValue::new(sequence))? {
            trace!(
                database = %self.database,
                binlog_info = %event.binlog_info,
                "Position already indexed, stored without index entry"
            );
        }
        Ok(sequence)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.data.flush()?;
        self.index.flush()
    }
}

impl LifeCycle for WriteChannel {
    fn start(&mut self) -> Result<()> {
        self.data.start()?;
        self.index.start()
    }

    fn stop(&mut self) -> Result<()> {
        self.data.stop()?;
        self.index.stop()
    }

    fn is_started(&self) -> bool {
        self.data.is_started() && self.index.is_started()
    }
}
