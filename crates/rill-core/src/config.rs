use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Error, Result};

/// Storage configuration shared by readers and writers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; each database lives in `<data_dir>/<database>`
    pub data_dir: PathBuf,

    /// Data segment size in bytes before rolling to a new segment
    pub max_segment_size: u64,

    /// fsync data and index files on flush
    pub fsync: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_segment_size: 256 * 1024 * 1024, // 256MB
            fsync: false,
        }
    }
}

impl StorageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_max_segment_size(mut self, max_segment_size: u64) -> Self {
        self.max_segment_size = max_segment_size;
        self
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    /// Directory holding one database's index and data stores
    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.data_dir.join(database)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_segment_size == 0 {
            return Err(Error::InvalidConfig(
                "max_segment_size must be greater than zero".to_string(),
            ));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("data_dir must not be empty".to_string()));
        }
        Ok(())
    }
}
