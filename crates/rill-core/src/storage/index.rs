//! Two-level position index
//!
//! Maps logical [`BinlogInfo`] positions to physical [`Sequence`]s.
//!
//! ```text
//! <database>/index/
//!   l1.index          L1: binlog file name -> L2 bucket (append order)
//!   0000000000.l2     L2: position -> sequence, one bucket per binlog file
//!   0000000001.l2
//! ```
//!
//! Both levels are CRC-framed append logs on disk and hashed/sorted maps in
//! memory. Entries are never rewritten; the first sequence recorded for a
//! position wins.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::frame::{FrameTail, FrameWriter};
use super::LifeCycle;
use crate::{BinlogInfo, Error, Result, Sequence};

const INDEX_DIR: &str = "index";
const L1_FILE: &str = "l1.index";
const L2_SUFFIX: &str = "l2";

/// Lookup key derived from a [`BinlogInfo`]; the skip flag is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct L1IndexKey {
    binlog_file: String,
    binlog_position: u64,
}

impl L1IndexKey {
    pub fn binlog_file(&self) -> &str {
        &self.binlog_file
    }

    pub fn binlog_position(&self) -> u64 {
        self.binlog_position
    }
}

impl From<&BinlogInfo> for L1IndexKey {
    fn from(info: &BinlogInfo) -> Self {
        Self {
            binlog_file: info.binlog_file().to_string(),
            binlog_position: info.binlog_position(),
        }
    }
}

/// Physical position recorded for a logical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2IndexValue {
    sequence: Sequence,
}

impl L2IndexValue {
    pub fn new(sequence: Sequence) -> Self {
        Self { sequence }
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct L1Record {
    binlog_file: String,
    bucket: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct L2Record {
    position: u64,
    value: L2IndexValue,
}

#[derive(Debug, Default)]
struct Bucket {
    entries: BTreeMap<u64, L2IndexValue>,
    oldest: Option<L2IndexValue>,
    latest: Option<L2IndexValue>,
}

impl Bucket {
    fn insert(&mut self, position: u64, value: L2IndexValue) -> bool {
        if self.entries.contains_key(&position) {
            return false;
        }
        self.entries.insert(position, value);
        if self.oldest.map_or(true, |o| value.sequence < o.sequence) {
            self.oldest = Some(value);
        }
        if self.latest.map_or(true, |l| value.sequence > l.sequence) {
            self.latest = Some(value);
        }
        true
    }
}

/// In-memory image of the on-disk index.
#[derive(Debug, Default)]
struct IndexView {
    buckets_by_file: HashMap<String, u32>,
    buckets: BTreeMap<u32, Bucket>,
}

impl IndexView {
    fn add_bucket(&mut self, record: L1Record) {
        self.buckets_by_file.insert(record.binlog_file, record.bucket);
        self.buckets.entry(record.bucket).or_default();
    }

    fn insert(&mut self, bucket: u32, record: L2Record) -> bool {
        self.buckets
            .entry(bucket)
            .or_default()
            .insert(record.position, record.value)
    }

    fn find(&self, key: &L1IndexKey) -> Option<L2IndexValue> {
        let bucket = self.buckets_by_file.get(&key.binlog_file)?;
        self.buckets
            .get(bucket)?
            .entries
            .get(&key.binlog_position)
            .copied()
    }

    fn oldest(&self) -> Option<L2IndexValue> {
        self.buckets
            .values()
            .filter_map(|b| b.oldest)
            .min_by_key(|v| v.sequence)
    }

    fn latest(&self) -> Option<L2IndexValue> {
        self.buckets
            .values()
            .filter_map(|b| b.latest)
            .max_by_key(|v| v.sequence)
    }

    fn next_bucket_id(&self) -> u32 {
        self.buckets.keys().next_back().map_or(0, |id| id + 1)
    }
}

fn bucket_path(dir: &Path, bucket: u32) -> PathBuf {
    dir.join(format!("{:010}.{}", bucket, L2_SUFFIX))
}

pub(crate) fn index_dir(database_dir: &Path) -> PathBuf {
    database_dir.join(INDEX_DIR)
}

/// Incrementally loads index files written by a (possibly live) writer.
#[derive(Debug)]
struct IndexLoader {
    dir: PathBuf,
    l1: FrameTail<L1Record>,
    l2: BTreeMap<u32, FrameTail<L2Record>>,
}

impl IndexLoader {
    fn new(dir: PathBuf) -> Self {
        let l1 = FrameTail::new(dir.join(L1_FILE));
        Self {
            dir,
            l1,
            l2: BTreeMap::new(),
        }
    }

    fn refresh(&mut self, view: &mut IndexView) -> Result<()> {
        for record in self.l1.read_new()? {
            let bucket = record.bucket;
            view.add_bucket(record);
            self.l2
                .entry(bucket)
                .or_insert_with(|| FrameTail::new(bucket_path(&self.dir, bucket)));
        }
        for (bucket, tail) in self.l2.iter_mut() {
            for record in tail.read_new()? {
                view.insert(*bucket, record);
            }
        }
        Ok(())
    }
}

/// Read side of the index. Picks up entries appended by the writer on every
/// lookup, so readers never block the writer or each other.
#[derive(Debug)]
pub struct ReadIndexManager {
    database: String,
    dir: PathBuf,
    loader: Option<IndexLoader>,
    view: IndexView,
}

impl ReadIndexManager {
    pub fn new(database: impl Into<String>, database_dir: &Path) -> Self {
        Self {
            database: database.into(),
            dir: index_dir(database_dir),
            loader: None,
            view: IndexView::default(),
        }
    }

    fn refreshed(&mut self) -> Result<&IndexView> {
        let loader = self.loader.as_mut().ok_or_else(|| {
            Error::invalid_state(format!("index reader for {} is not started", self.database))
        })?;
        loader.refresh(&mut self.view)?;
        Ok(&self.view)
    }

    /// Globally first entry, if any.
    pub fn find_oldest(&mut self) -> Result<Option<L2IndexValue>> {
        Ok(self.refreshed()?.oldest())
    }

    /// Globally last entry, if any.
    pub fn find_latest(&mut self) -> Result<Option<L2IndexValue>> {
        Ok(self.refreshed()?.latest())
    }

    /// Exact-match lookup.
    pub fn find(&mut self, key: &L1IndexKey) -> Result<Option<L2IndexValue>> {
        Ok(self.refreshed()?.find(key))
    }
}

impl LifeCycle for ReadIndexManager {
    fn start(&mut self) -> Result<()> {
        self.view = IndexView::default();
        self.loader = Some(IndexLoader::new(self.dir.clone()));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.loader = None;
        self.view = IndexView::default();
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.loader.is_some()
    }
}

#[derive(Debug)]
struct IndexFiles {
    l1: FrameWriter,
    current: Option<(u32, FrameWriter)>,
}

/// Write side of the index. One per database at a time (see
/// [`DatabaseStorageManager`](super::DatabaseStorageManager)).
#[derive(Debug)]
pub struct WriteIndexManager {
    database: String,
    dir: PathBuf,
    fsync: bool,
    files: Option<IndexFiles>,
    view: IndexView,
}

impl WriteIndexManager {
    pub fn new(database: impl Into<String>, database_dir: &Path, fsync: bool) -> Self {
        Self {
            database: database.into(),
            dir: index_dir(database_dir),
            fsync,
            files: None,
            view: IndexView::default(),
        }
    }

    /// Record `value` for `key`. Returns `false` when the key is already
    /// indexed; the existing entry is kept.
    pub fn append(&mut self, key: &L1IndexKey, value: L2IndexValue) -> Result<bool> {
        if self.view.find(key).is_some() {
            return Ok(false);
        }

        let files = self.files.as_mut().ok_or_else(|| {
            Error::invalid_state(format!("index writer for {} is not started", self.database))
        })?;

        let bucket = match self.view.buckets_by_file.get(&key.binlog_file) {
            Some(bucket) => *bucket,
            None => {
                let record = L1Record {
                    binlog_file: key.binlog_file.clone(),
                    bucket: self.view.next_bucket_id(),
                };
                files.l1.append(&record)?;
                files.l1.flush(self.fsync)?;
                debug!(
                    database = %self.database,
                    binlog_file = %record.binlog_file,
                    bucket = record.bucket,
                    "Opened index bucket"
                );
                let bucket = record.bucket;
                self.view.add_bucket(record);
                bucket
            }
        };

        if files.current.as_ref().map(|(id, _)| *id) != Some(bucket) {
            if let Some((_, mut previous)) = files.current.take() {
                previous.flush(self.fsync)?;
            }
            files.current = Some((bucket, FrameWriter::open(bucket_path(&self.dir, bucket))?));
        }

        let record = L2Record {
            position: key.binlog_position,
            value,
        };
        if let Some((_, writer)) = files.current.as_mut() {
            writer.append(&record)?;
        }
        Ok(self.view.insert(bucket, record))
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(files) = self.files.as_mut() {
            files.l1.flush(self.fsync)?;
            if let Some((_, writer)) = files.current.as_mut() {
                writer.flush(self.fsync)?;
            }
        }
        Ok(())
    }
}

impl LifeCycle for WriteIndexManager {
    fn start(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut view = IndexView::default();
        IndexLoader::new(self.dir.clone()).refresh(&mut view)?;
        self.view = view;

        self.files = Some(IndexFiles {
            l1: FrameWriter::open(self.dir.join(L1_FILE))?,
            current: None,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.flush()?;
        self.files = None;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.files.is_some()
    }
}
