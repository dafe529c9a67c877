//! Task executors
//!
//! An executor drives exactly one [`InstanceTask`] snapshot: it pulls events
//! from the instance's binlog, writes them into the storage of the databases
//! the task owns, and checkpoints its position under the task's name.
//!
//! ```text
//!   Created ──run──► Running ──stop──► Stopping ──► Stopped
//!      │                │                              ▲
//!      │                └──── source/storage error ────┤
//!      └──────────────────────stop─────────────────────┘
//! ```
//!
//! Write channels are opened when the executor is built and released when it
//! reaches `Stopped`, so a stopped executor never holds a database's writer
//! lease.

use async_trait::async_trait;
use parking_lot::Mutex;
use rill_core::{BinlogInfo, BinlogInfoHolder, LifeCycle, WriteChannel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ExecutorConfig;
use crate::source::SourceFactory;
use crate::task::InstanceTask;
use crate::{ServerError, ServerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Lifecycle contract of the runtime actor serving one instance task.
#[async_trait]
pub trait TaskExecutor: Send + Sync + fmt::Debug {
    /// The snapshot this executor was built for. Never changes.
    fn instance_task(&self) -> &InstanceTask;

    fn task_name(&self) -> String {
        self.instance_task().task_name()
    }

    /// Run until stopped or failed. Called once, on a pool worker.
    async fn run(&self) -> ServerResult<()>;

    /// Stop and wait until the executor has released its storage.
    async fn stop(&self) -> ServerResult<()>;

    fn state(&self) -> ExecutorState;

    fn is_stopped(&self) -> bool {
        self.state() == ExecutorState::Stopped
    }

    /// Set while the executor takes part in a pending merge or upgrade.
    fn is_merging(&self) -> bool;

    fn set_merging(&self, merging: bool);
}

/// Whether two handles refer to the same executor instance.
pub(crate) fn same_executor(a: &Arc<dyn TaskExecutor>, b: &Arc<dyn TaskExecutor>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Marks the executor stopped however the run future ends.
struct StoppedOnDrop<'a>(&'a watch::Sender<ExecutorState>);

impl Drop for StoppedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(ExecutorState::Stopped);
    }
}

pub struct DefaultTaskExecutor {
    task: InstanceTask,
    writers: Mutex<Option<HashMap<String, WriteChannel>>>,
    source_factory: Arc<dyn SourceFactory>,
    holder: Arc<dyn BinlogInfoHolder>,
    config: ExecutorConfig,
    state: watch::Sender<ExecutorState>,
    merging: AtomicBool,
    cancel: CancellationToken,
}

impl fmt::Debug for DefaultTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTaskExecutor")
            .field("task", &self.task)
            .field("state", &*self.state.borrow())
            .field("merging", &self.merging.load(Ordering::SeqCst))
            .finish()
    }
}

impl DefaultTaskExecutor {
    /// `writers` must hold one started write channel per database of `task`.
    pub fn new(
        task: InstanceTask,
        writers: HashMap<String, WriteChannel>,
        source_factory: Arc<dyn SourceFactory>,
        holder: Arc<dyn BinlogInfoHolder>,
        config: ExecutorConfig,
    ) -> Self {
        let (state, _) = watch::channel(ExecutorState::Created);
        Self {
            task,
            writers: Mutex::new(Some(writers)),
            source_factory,
            holder,
            config,
            state,
            merging: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Receiver for observing state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ExecutorState> {
        self.state.subscribe()
    }

    async fn checkpoint(
        &self,
        task_name: &str,
        writers: &mut HashMap<String, WriteChannel>,
        last: &BinlogInfo,
    ) -> ServerResult<()> {
        for writer in writers.values_mut() {
            writer.flush()?;
        }
        self.holder.set(task_name, last.skipping_next()).await?;
        trace!(task = %task_name, binlog_info = %last, "Checkpointed binlog position");
        Ok(())
    }

    async fn run_loop(&self, mut writers: HashMap<String, WriteChannel>) -> ServerResult<()> {
        let task_name = self.task.task_name();
        let start = self.holder.get(&task_name).await?;
        let mut source = self.source_factory.open(&self.task, start.clone()).await?;

        info!(
            task = %task_name,
            databases = writers.len(),
            start = ?start.as_ref().map(ToString::to_string),
            "Executor running"
        );

        let interval = self.config.checkpoint_interval.max(1);
        let mut last: Option<BinlogInfo> = None;
        let mut pending = 0u64;

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                next = source.next() => next,
            };

            match next {
                Ok(Some(event)) => {
                    match writers.get_mut(&event.database) {
                        Some(writer) => {
                            if let Err(e) = writer.write(&event) {
                                break Err(ServerError::from(e));
                            }
                        }
                        None => trace!(
                            task = %task_name,
                            database = %event.database,
                            "Skipping event for unowned database"
                        ),
                    }

                    last = Some(event.binlog_info);
                    pending += 1;
                    if pending >= interval {
                        if let Some(last) = &last {
                            if let Err(e) = self.checkpoint(&task_name, &mut writers, last).await {
                                break Err(e);
                            }
                        }
                        pending = 0;
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        if pending > 0 {
            if let Some(last) = &last {
                if let Err(e) = self.checkpoint(&task_name, &mut writers, last).await {
                    warn!(task = %task_name, error = %e, "Final checkpoint failed");
                }
            }
        }
        for (database, writer) in writers.iter_mut() {
            if let Err(e) = writer.stop() {
                warn!(task = %task_name, database = %database, error = %e, "Failed to close write channel");
            }
        }

        result
    }
}

#[async_trait]
impl TaskExecutor for DefaultTaskExecutor {
    fn instance_task(&self) -> &InstanceTask {
        &self.task
    }

    async fn run(&self) -> ServerResult<()> {
        let started = self.state.send_if_modified(|state| {
            if *state == ExecutorState::Created {
                *state = ExecutorState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ServerError::InvalidState(format!(
                "executor {} cannot run from state {}",
                self.task.task_name(),
                self.state()
            )));
        }

        let _stopped = StoppedOnDrop(&self.state);
        let writers = self.writers.lock().take().unwrap_or_default();
        let result = self.run_loop(writers).await;

        info!(
            task = %self.task.task_name(),
            ok = result.is_ok(),
            "Executor finished"
        );
        result
    }

    async fn stop(&self) -> ServerResult<()> {
        let mut never_ran = false;
        self.state.send_if_modified(|state| match state {
            ExecutorState::Created => {
                *state = ExecutorState::Stopped;
                never_ran = true;
                true
            }
            ExecutorState::Running => {
                *state = ExecutorState::Stopping;
                true
            }
            ExecutorState::Stopping | ExecutorState::Stopped => false,
        });

        let task_name = self.task.task_name();
        if never_ran {
            if let Some(mut writers) = self.writers.lock().take() {
                for writer in writers.values_mut() {
                    writer.stop()?;
                }
            }
            debug!(task = %task_name, "Stopped executor that never ran");
            return Ok(());
        }

        self.cancel.cancel();
        let mut rx = self.state.subscribe();
        rx.wait_for(|state| *state == ExecutorState::Stopped)
            .await
            .map_err(|e| ServerError::shutdown(&task_name, e))?;

        debug!(task = %task_name, "Executor stopped");
        Ok(())
    }

    fn state(&self) -> ExecutorState {
        *self.state.borrow()
    }

    fn is_merging(&self) -> bool {
        self.merging.load(Ordering::SeqCst)
    }

    fn set_merging(&self, merging: bool) {
        self.merging.store(merging, Ordering::SeqCst);
    }
}
