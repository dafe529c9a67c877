//! # rill-core - Binlog change-event storage
//!
//! Captured MySQL change events are stored per database and addressed two
//! ways: physically by [`Sequence`] and logically by [`BinlogInfo`].
//!
//! ```text
//!   BinlogInfo ──► L1 (binlog file) ──► L2 (position) ──► Sequence
//!                                                           │
//!                                                           ▼
//!                                        data segment ──► ChangeEvent, next
//! ```
//!
//! Executors write through a [`WriteChannel`]; consumers read through any
//! number of independent [`ReadChannel`]s opened at the oldest, latest, or an
//! exact recorded position.
//!
//! ```rust,no_run
//! use rill_core::{BinlogInfo, DatabaseStorageManager, LifeCycle, ReadChannel, StorageConfig};
//!
//! # fn example() -> rill_core::Result<()> {
//! let storage = DatabaseStorageManager::new(StorageConfig::new().with_data_dir("/var/lib/rill"));
//! let mut channel = storage.read_channel("orders")?;
//! channel.start()?;
//! channel.open(&BinlogInfo::new("mysql-bin.000003", 120).skipping_next())?;
//! let event = channel.next()?;
//! println!("{} at {}", event.table, event.binlog_info);
//! # Ok(())
//! # }
//! ```

pub mod binlog;
pub mod config;
pub mod error;
pub mod event;
pub mod holder;
pub mod sequence;
pub mod storage;

pub use binlog::BinlogInfo;
pub use config::StorageConfig;
pub use error::{Error, Result};
pub use event::{ChangeEvent, ChangeOp};
pub use holder::{BinlogInfoHolder, FileBinlogInfoHolder, MemoryBinlogInfoHolder, PositionRecord};
pub use sequence::Sequence;
pub use storage::{
    poll_next, DatabaseStorageManager, DefaultReadChannel, LifeCycle, OpenPosition, ReadChannel,
    WriteChannel,
};
