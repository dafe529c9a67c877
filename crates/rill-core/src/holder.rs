//! Binlog-position persistence keyed by task name
//!
//! Executors checkpoint the last consumed [`BinlogInfo`] under their task
//! name and resume from it on start. When a task changes identity the record
//! is renamed, never recreated, so the new identity resumes exactly where the
//! old one stopped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{BinlogInfo, Error, Result};

const RECORD_SUFFIX: &str = "json";

/// Stored form of a task's position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub binlog_info: BinlogInfo,
    pub updated_at: DateTime<Utc>,
}

impl PositionRecord {
    pub fn new(binlog_info: BinlogInfo) -> Self {
        Self {
            binlog_info,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait BinlogInfoHolder: Send + Sync {
    async fn get(&self, task_name: &str) -> Result<Option<BinlogInfo>>;

    async fn set(&self, task_name: &str, binlog_info: BinlogInfo) -> Result<()>;

    /// Move the record of `from` to `to`. A missing source is a no-op; an
    /// existing record under `to` is replaced.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn remove(&self, task_name: &str) -> Result<()>;
}

fn validate_task_name(task_name: &str) -> Result<()> {
    if task_name.is_empty() || task_name.contains(['/', '\\', '\0']) || task_name.starts_with('.')
    {
        return Err(Error::InvalidConfig(format!(
            "invalid task name for position record: {:?}",
            task_name
        )));
    }
    Ok(())
}

/// One JSON file per task under a base directory, written atomically
/// through a temp file and rename.
#[derive(Debug)]
pub struct FileBinlogInfoHolder {
    base_dir: PathBuf,
    fsync: bool,
    cache: RwLock<HashMap<String, PositionRecord>>,
}

impl FileBinlogInfoHolder {
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        let holder = Self {
            base_dir,
            fsync,
            cache: RwLock::new(HashMap::new()),
        };
        holder.load_all().await?;
        Ok(holder)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Full record, including when it was last written.
    pub async fn record(&self, task_name: &str) -> Option<PositionRecord> {
        self.cache.read().await.get(task_name).cloned()
    }

    pub async fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn file_path(&self, task_name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", task_name, RECORD_SUFFIX))
    }

    async fn write_record(&self, task_name: &str, record: &PositionRecord) -> Result<()> {
        let path = self.file_path(task_name);
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(record)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn remove_file(&self, task_name: &str) -> Result<()> {
        match fs::remove_file(self.file_path(task_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut cache = self.cache.write().await;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == RECORD_SUFFIX) {
                continue;
            }
            let Some(task_name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let contents = fs::read(&path).await?;
            match serde_json::from_slice::<PositionRecord>(&contents) {
                Ok(record) => {
                    cache.insert(task_name.to_string(), record);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable position record");
                }
            }
        }

        if !cache.is_empty() {
            info!(
                count = cache.len(),
                path = %self.base_dir.display(),
                "Loaded binlog position records"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl BinlogInfoHolder for FileBinlogInfoHolder {
    async fn get(&self, task_name: &str) -> Result<Option<BinlogInfo>> {
        Ok(self
            .cache
            .read()
            .await
            .get(task_name)
            .map(|record| record.binlog_info.clone()))
    }

    async fn set(&self, task_name: &str, binlog_info: BinlogInfo) -> Result<()> {
        validate_task_name(task_name)?;
        let record = PositionRecord::new(binlog_info);
        self.write_record(task_name, &record).await?;

        debug!(task = %task_name, binlog_info = %record.binlog_info, "Saved binlog position");
        self.cache.write().await.insert(task_name.to_string(), record);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        validate_task_name(from)?;
        validate_task_name(to)?;
        if from == to {
            return Ok(());
        }

        let mut cache = self.cache.write().await;
        let Some(record) = cache.get(from).cloned() else {
            debug!(from = %from, to = %to, "No binlog position to rename");
            return Ok(());
        };

        // Same directory, so the rename replaces any record under `to`
        fs::rename(self.file_path(from), self.file_path(to)).await?;
        cache.remove(from);
        cache.insert(to.to_string(), record);

        info!(from = %from, to = %to, "Renamed binlog position record");
        Ok(())
    }

    async fn remove(&self, task_name: &str) -> Result<()> {
        validate_task_name(task_name)?;
        self.remove_file(task_name).await?;
        if self.cache.write().await.remove(task_name).is_some() {
            info!(task = %task_name, "Removed binlog position record");
        }
        Ok(())
    }
}

/// In-memory holder for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryBinlogInfoHolder {
    records: RwLock<HashMap<String, BinlogInfo>>,
}

impl MemoryBinlogInfoHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl BinlogInfoHolder for MemoryBinlogInfoHolder {
    async fn get(&self, task_name: &str) -> Result<Option<BinlogInfo>> {
        Ok(self.records.read().await.get(task_name).cloned())
    }

    async fn set(&self, task_name: &str, binlog_info: BinlogInfo) -> Result<()> {
        validate_task_name(task_name)?;
        self.records
            .write()
            .await
            .insert(task_name.to_string(), binlog_info);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(info) = records.remove(from) {
            records.insert(to.to_string(), info);
        }
        Ok(())
    }

    async fn remove(&self, task_name: &str) -> Result<()> {
        self.records.write().await.remove(task_name);
        Ok(())
    }
}
