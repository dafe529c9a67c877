//! Per-database change-event storage
//!
//! Each database served by an executor owns a directory holding a data log
//! and a two-level position index:
//!
//! ```text
//! <data_dir>/<database>/
//!   data/    segmented log of ChangeEvents, addressed by Sequence
//!   index/   BinlogInfo -> Sequence
//! ```

mod channel;
mod data;
mod frame;
mod index;
mod manager;

pub use channel::{poll_next, DefaultReadChannel, OpenPosition, ReadChannel, WriteChannel};
pub use data::{DataKey, DataValue, ReadDataManager, WriteDataManager};
pub use index::{L1IndexKey, L2IndexValue, ReadIndexManager, WriteIndexManager};
pub use manager::{DatabaseStorageManager, WriterLease};

use crate::Result;

/// Explicit start/stop for storage components. Using a component before
/// `start` (or after `stop`) fails with `InvalidState`.
pub trait LifeCycle {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn is_started(&self) -> bool;
}
