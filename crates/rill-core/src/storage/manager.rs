//! Per-database storage ownership
//!
//! Any number of read channels may be open on a database, but only one write
//! channel. The write side is guarded by a lease that is released when the
//! channel is dropped; deleting a database is refused while a lease is held.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::channel::{DefaultReadChannel, WriteChannel};
use super::data::WriteDataManager;
use super::index::WriteIndexManager;
use crate::{Error, Result, StorageConfig};

/// Exclusive right to write one database's storage.
#[derive(Debug)]
pub struct WriterLease {
    database: String,
    leases: Arc<Mutex<HashSet<String>>>,
}

impl WriterLease {
    pub fn database(&self) -> &str {
        &self.database
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.database);
        debug!(database = %self.database, "Released writer lease");
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseStorageManager {
    config: StorageConfig,
    leases: Arc<Mutex<HashSet<String>>>,
}

impl DatabaseStorageManager {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Directory holding `database`'s storage.
    pub fn database_dir(&self, database: &str) -> Result<PathBuf> {
        validate_database_name(database)?;
        Ok(self.config.database_dir(database))
    }

    /// Unstarted read channel for `database`.
    pub fn read_channel(&self, database: &str) -> Result<DefaultReadChannel> {
        let dir = self.database_dir(database)?;
        Ok(DefaultReadChannel::new(database, dir))
    }

    /// Unstarted write channel for `database`, holding its writer lease.
    ///
    /// Fails with [`Error::WriterBusy`] while another write channel for the
    /// same database is alive.
    pub fn write_channel(&self, database: &str) -> Result<WriteChannel> {
        let dir = self.database_dir(database)?;
        let lease = self.acquire(database)?;

        let index = WriteIndexManager::new(database, &dir, self.config.fsync);
        let data = WriteDataManager::new(
            database,
            &dir,
            self.config.max_segment_size,
            self.config.fsync,
        );
        Ok(WriteChannel::new(database.to_string(), index, data, lease))
    }

    pub fn is_writing(&self, database: &str) -> bool {
        self.leases.lock().contains(database)
    }

    pub fn exists(&self, database: &str) -> bool {
        self.database_dir(database)
            .map(|dir| dir.exists())
            .unwrap_or(false)
    }

    /// Delete everything stored for `database`. Missing storage is not an
    /// error.
    pub fn delete(&self, database: &str) -> Result<()> {
        let dir = self.database_dir(database)?;
        if self.is_writing(database) {
            return Err(Error::WriterBusy(format!(
                "cannot delete {} while it is being written",
                database
            )));
        }

        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(database = %database, path = %dir.display(), "Deleted database storage");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn acquire(&self, database: &str) -> Result<WriterLease> {
        let mut leases = self.leases.lock();
        if !leases.insert(database.to_string()) {
            return Err(Error::WriterBusy(database.to_string()));
        }
        debug!(database = %database, "Acquired writer lease");
        Ok(WriterLease {
            database: database.to_string(),
            leases: Arc::clone(&self.leases),
        })
    }
}

/// Reject names that would escape the data directory.
fn validate_database_name(database: &str) -> Result<()> {
    if database.is_empty() {
        return Err(Error::InvalidConfig("database name cannot be empty".into()));
    }
    if database == "." || database == ".." || database.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidConfig(format!(
            "invalid database name: {}",
            database
        )));
    }
    Ok(())
}
