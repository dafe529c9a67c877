//! Worker pool running executors
//!
//! Each executor runs as its own tokio task. Failures inside an executor are
//! logged where its future completes and never reach the submitter; only a
//! failure to submit (pool exhausted, executor not fresh) is returned.
//!
//! An executor reports `Stopped` before its worker has returned its slot.
//! Callers that replace an executor [`join`](ExecutorPool::join) the old one
//! first, so the replacement finds the slot free.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::executor::{same_executor, ExecutorState, TaskExecutor};
use crate::{ServerError, ServerResult};

#[derive(Debug)]
struct Worker {
    executor: Arc<dyn TaskExecutor>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct ExecutorPool {
    capacity: usize,
    permits: Arc<Semaphore>,
    workers: Mutex<HashMap<String, Worker>>,
}

impl ExecutorPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of executors currently holding a worker slot.
    pub fn active(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Start `executor` on a worker. Returns as soon as it is scheduled.
    pub fn execute(&self, executor: Arc<dyn TaskExecutor>) -> ServerResult<()> {
        let task_name = executor.task_name();
        let state = executor.state();
        if state != ExecutorState::Created {
            return Err(ServerError::startup(
                &task_name,
                format!("executor cannot start from state {}", state),
            ));
        }

        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| {
                ServerError::startup(
                    &task_name,
                    format!("executor pool exhausted ({} workers)", self.capacity),
                )
            })?;

        let name = task_name.clone();
        let running = Arc::clone(&executor);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            match running.run().await {
                Ok(()) => info!(task = %name, "Executor exited"),
                Err(e) => error!(
                    task = %name,
                    error = %e,
                    category = ?e.category(),
                    "Executor failed"
                ),
            }
        });

        let mut workers = self.workers.lock();
        workers.retain(|_, w| !w.handle.is_finished());
        workers.insert(task_name.clone(), Worker { executor, handle });
        drop(workers);
        debug!(task = %task_name, active = self.active(), "Submitted executor");
        Ok(())
    }

    /// Wait until the worker running `executor` has returned its slot.
    ///
    /// Only meaningful once the executor is stopping; does nothing if
    /// `executor` was never submitted or its worker is already gone.
    pub async fn join(&self, executor: &Arc<dyn TaskExecutor>) {
        let task_name = executor.task_name();
        let worker = {
            let mut workers = self.workers.lock();
            match workers.get(&task_name) {
                Some(w) if same_executor(&w.executor, executor) => workers.remove(&task_name),
                _ => None,
            }
        };

        if let Some(worker) = worker {
            if let Err(e) = worker.handle.await {
                warn!(task = %task_name, error = %e, "Executor worker did not finish cleanly");
            }
            debug!(task = %task_name, active = self.active(), "Joined executor worker");
        }
    }

    /// Whether an executor submitted under `task_name` is still running.
    pub fn is_running(&self, task_name: &str) -> bool {
        self.workers
            .lock()
            .get(task_name)
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Abort every worker. Executors are not stopped gracefully.
    pub fn shutdown(&self) {
        for (task_name, worker) in self.workers.lock().drain() {
            worker.handle.abort();
            debug!(task = %task_name, "Aborted executor worker");
        }
    }
}
