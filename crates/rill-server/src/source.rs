//! Binlog sources feeding task executors
//!
//! The binlog protocol reader lives outside this crate; executors only see
//! the [`BinlogSource`] trait. [`MemoryBinlog`] is an in-process source for
//! tests and embedded use.

use async_trait::async_trait;
use parking_lot::RwLock;
use rill_core::{BinlogInfo, ChangeEvent};
use std::collections::HashMap;
use std::sync::Arc;

use crate::task::InstanceTask;
use crate::ServerResult;

/// Ordered stream of change events for one instance.
#[async_trait]
pub trait BinlogSource: Send {
    /// Next event, or `None` when none is currently available.
    ///
    /// Must be cancel-safe: the executor drops an in-flight call on stop, and
    /// no event may be lost when it does.
    async fn next(&mut self) -> ServerResult<Option<ChangeEvent>>;
}

/// Opens sources for executors.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    /// Open a stream for `task`'s instance. With a `start` position the
    /// stream begins at that event, or just after it when the position's
    /// skip flag is set; without one it begins at the earliest event.
    async fn open(
        &self,
        task: &InstanceTask,
        start: Option<BinlogInfo>,
    ) -> ServerResult<Box<dyn BinlogSource>>;
}

type InstanceLog = Arc<RwLock<Vec<ChangeEvent>>>;

/// In-memory binlog per instance. Events must be pushed in binlog order.
#[derive(Debug, Clone, Default)]
pub struct MemoryBinlog {
    logs: Arc<RwLock<HashMap<String, InstanceLog>>>,
}

impl MemoryBinlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, instance: &str, event: ChangeEvent) {
        self.log(instance).write().push(event);
    }

    pub fn len(&self, instance: &str) -> usize {
        self.logs
            .read()
            .get(instance)
            .map(|log| log.read().len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, instance: &str) -> bool {
        self.len(instance) == 0
    }

    fn log(&self, instance: &str) -> InstanceLog {
        if let Some(log) = self.logs.read().get(instance) {
            return Arc::clone(log);
        }
        Arc::clone(self.logs.write().entry(instance.to_string()).or_default())
    }
}

fn position_key(info: &BinlogInfo) -> (&str, u64) {
    (info.binlog_file(), info.binlog_position())
}

/// Index of the first event to deliver when resuming from `start`.
fn resume_index(events: &[ChangeEvent], start: &BinlogInfo) -> usize {
    let target = position_key(start);
    match events
        .iter()
        .position(|e| position_key(&e.binlog_info) >= target)
    {
        Some(index) => {
            let exact = position_key(&events[index].binlog_info) == target;
            if exact && start.skip_to_next_pos() {
                index + 1
            } else {
                index
            }
        }
        None => events.len(),
    }
}

#[async_trait]
impl SourceFactory for MemoryBinlog {
    async fn open(
        &self,
        task: &InstanceTask,
        start: Option<BinlogInfo>,
    ) -> ServerResult<Box<dyn BinlogSource>> {
        let log = self.log(task.instance());
        let cursor = match &start {
            Some(start) => resume_index(&log.read(), start),
            None => 0,
        };
        Ok(Box::new(MemoryBinlogSource { log, cursor }))
    }
}

struct MemoryBinlogSource {
    log: InstanceLog,
    cursor: usize,
}

#[async_trait]
impl BinlogSource for MemoryBinlogSource {
    async fn next(&mut self) -> ServerResult<Option<ChangeEvent>> {
        let event = self.log.read().get(self.cursor).cloned();
        if event.is_some() {
            self.cursor += 1;
        }
        Ok(event)
    }
}
