//! Executor construction

use rill_core::{BinlogInfoHolder, DatabaseStorageManager, LifeCycle};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::ExecutorConfig;
use crate::executor::{DefaultTaskExecutor, TaskExecutor};
use crate::source::SourceFactory;
use crate::task::InstanceTask;
use crate::{ServerError, ServerResult};

/// Builds a new, unstarted executor for an instance task snapshot.
pub trait TaskBuilder: Send + Sync {
    fn build(&self, task: InstanceTask) -> ServerResult<Arc<dyn TaskExecutor>>;
}

pub struct DefaultTaskBuilder {
    storage: DatabaseStorageManager,
    holder: Arc<dyn BinlogInfoHolder>,
    source_factory: Arc<dyn SourceFactory>,
    config: ExecutorConfig,
}

impl DefaultTaskBuilder {
    pub fn new(
        storage: DatabaseStorageManager,
        holder: Arc<dyn BinlogInfoHolder>,
        source_factory: Arc<dyn SourceFactory>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            storage,
            holder,
            source_factory,
            config,
        }
    }
}

impl TaskBuilder for DefaultTaskBuilder {
    /// Opens a write channel for every database of `task`. Fails while any
    /// of them is still held by another executor.
    fn build(&self, task: InstanceTask) -> ServerResult<Arc<dyn TaskExecutor>> {
        let task_name = task.task_name();
        let mut writers = HashMap::with_capacity(task.size());

        for database in task.databases() {
            let mut writer = self
                .storage
                .write_channel(database)
                .map_err(|e| ServerError::startup(&task_name, e))?;
            writer
                .start()
                .map_err(|e| ServerError::startup(&task_name, e))?;
            writers.insert(database.to_string(), writer);
        }

        debug!(task = %task_name, databases = writers.len(), "Built executor");
        Ok(Arc::new(DefaultTaskExecutor::new(
            task,
            writers,
            Arc::clone(&self.source_factory),
            Arc::clone(&self.holder),
            self.config.clone(),
        )))
    }
}
