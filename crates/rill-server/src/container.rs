//! Task orchestration
//!
//! [`TaskContainer`] is the single authority on which executor serves which
//! database. Every database of every live instance task maps to the executor
//! running that task, and no database belongs to two tasks. Each structural
//! operation below preserves that before it returns.
//!
//! Structural operations are serialized by an administrative lock. Where an
//! operation replaces an executor it stops the old one and waits for its
//! worker slot first, so the new one can take the databases' writer leases
//! and a slot. Fallible steps (stop, build, submit) run before the mapping is
//! touched; a failure there leaves the mapping and position records as they
//! were.
//!
//! Registry announcements are retried with backoff. If they still fail the
//! error is returned but local state is kept: the database is served, and the
//! announcement can be repeated by the caller.

use parking_lot::RwLock;
use rill_core::{BinlogInfoHolder, DatabaseStorageManager, DefaultReadChannel};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::builder::{DefaultTaskBuilder, TaskBuilder};
use crate::config::{RegistryRetryConfig, ServerConfig};
use crate::executor::{same_executor, TaskExecutor};
use crate::pool::ExecutorPool;
use crate::registry::{InstanceResolver, RegistryService, StatusRegistry};
use crate::retry::retry;
use crate::source::SourceFactory;
use crate::task::{DatabaseTask, InstanceTask};
use crate::{ServerError, ServerResult};

/// External collaborators of the container.
#[derive(Clone)]
pub struct ContainerServices {
    pub registry: Arc<dyn RegistryService>,
    pub resolver: Arc<dyn InstanceResolver>,
    pub status: Arc<dyn StatusRegistry>,
    pub holder: Arc<dyn BinlogInfoHolder>,
    pub source_factory: Arc<dyn SourceFactory>,
}

pub struct TaskContainer {
    host: String,
    storage: DatabaseStorageManager,
    builder: Arc<dyn TaskBuilder>,
    pool: ExecutorPool,
    executors: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
    admin: Mutex<()>,
    registry: Arc<dyn RegistryService>,
    resolver: Arc<dyn InstanceResolver>,
    status: Arc<dyn StatusRegistry>,
    holder: Arc<dyn BinlogInfoHolder>,
    retry: RegistryRetryConfig,
}

impl TaskContainer {
    pub fn new(config: &ServerConfig, services: ContainerServices) -> ServerResult<Self> {
        let storage = DatabaseStorageManager::new(config.storage.clone());
        let builder = Arc::new(DefaultTaskBuilder::new(
            storage.clone(),
            Arc::clone(&services.holder),
            Arc::clone(&services.source_factory),
            config.executor.clone(),
        ));
        Self::assemble(config, services, storage, builder)
    }

    /// Container using a custom executor builder.
    pub fn with_builder(
        config: &ServerConfig,
        services: ContainerServices,
        builder: Arc<dyn TaskBuilder>,
    ) -> ServerResult<Self> {
        let storage = DatabaseStorageManager::new(config.storage.clone());
        Self::assemble(config, services, storage, builder)
    }

    fn assemble(
        config: &ServerConfig,
        services: ContainerServices,
        storage: DatabaseStorageManager,
        builder: Arc<dyn TaskBuilder>,
    ) -> ServerResult<Self> {
        config.validate()?;
        info!(
            host = %config.host,
            data_dir = %config.storage.data_dir.display(),
            max_executors = config.pool.max_executors,
            "Creating task container"
        );
        Ok(Self {
            host: config.host.clone(),
            storage,
            builder,
            pool: ExecutorPool::new(config.pool.max_executors),
            executors: RwLock::new(HashMap::new()),
            admin: Mutex::new(()),
            registry: services.registry,
            resolver: services.resolver,
            status: services.status,
            holder: services.holder,
            retry: config.registry.clone(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pool(&self) -> &ExecutorPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Executor currently serving `database`.
    pub fn executor(&self, database: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.read().get(database).cloned()
    }

    /// Every served database with its task.
    pub fn database_tasks(&self) -> HashMap<String, DatabaseTask> {
        let mut tasks = HashMap::new();
        for executor in self.distinct_executors() {
            for task in executor.instance_task().database_tasks() {
                tasks.insert(task.database().to_string(), task.clone());
            }
        }
        tasks
    }

    /// Main executor per instance.
    pub fn main_executors(&self) -> HashMap<String, Arc<dyn TaskExecutor>> {
        self.distinct_executors()
            .into_iter()
            .filter(|e| e.instance_task().is_main())
            .map(|e| (e.instance_task().instance().to_string(), e))
            .collect()
    }

    /// Temporary executors per instance.
    pub fn temp_executors(&self) -> HashMap<String, Vec<Arc<dyn TaskExecutor>>> {
        let mut temps: HashMap<String, Vec<Arc<dyn TaskExecutor>>> = HashMap::new();
        for executor in self.distinct_executors() {
            if !executor.instance_task().is_main() {
                temps
                    .entry(executor.instance_task().instance().to_string())
                    .or_default()
                    .push(executor);
            }
        }
        temps
    }

    /// Number of live instance tasks for `instance`.
    pub fn count(&self, instance: &str) -> usize {
        self.distinct_executors()
            .iter()
            .filter(|e| e.instance_task().instance() == instance)
            .count()
    }

    /// Unstarted read channel over a served database's storage.
    pub fn read_channel(&self, database: &str) -> ServerResult<DefaultReadChannel> {
        self.find_executor(database)?;
        Ok(self.storage.read_channel(database)?)
    }

    // ------------------------------------------------------------------
    // Structural operations
    // ------------------------------------------------------------------

    /// Build, start and register an executor for `task`, then announce its
    /// databases.
    pub async fn create_instance(
        &self,
        task: InstanceTask,
    ) -> ServerResult<Arc<dyn TaskExecutor>> {
        let _admin = self.admin.lock().await;
        info!(task = %task, "Creating instance task");

        self.check_admission(&task)?;
        let executor = self.build(task)?;
        self.start(&executor).await?;
        self.register_task(&executor);

        for database in executor.instance_task().databases() {
            self.announce(database).await?;
        }

        info!(task = %executor.task_name(), "Created instance task");
        Ok(executor)
    }

    /// Admit a single database. It becomes its instance's main task when the
    /// instance has no task yet, otherwise a temporary one.
    pub async fn create_database(
        &self,
        database_task: DatabaseTask,
    ) -> ServerResult<Arc<dyn TaskExecutor>> {
        let _admin = self.admin.lock().await;
        self.create_database_locked(database_task).await
    }

    /// Remove `database`, rebuilding its task without it.
    pub async fn remove(&self, database: &str) -> ServerResult<()> {
        let _admin = self.admin.lock().await;
        self.remove_locked(database).await
    }

    /// Remove then recreate `database`. It is unserved in between.
    pub async fn update(
        &self,
        database_task: DatabaseTask,
    ) -> ServerResult<Arc<dyn TaskExecutor>> {
        let _admin = self.admin.lock().await;
        info!(database = %database_task, "Updating database task");
        self.remove_locked(database_task.database()).await?;
        self.create_database_locked(database_task).await
    }

    /// Fold a caught-up temporary task into its instance's main task.
    ///
    /// Does nothing and returns `false` unless both executors are merging and
    /// stopped.
    pub async fn merge(
        &self,
        main: &Arc<dyn TaskExecutor>,
        temp: &Arc<dyn TaskExecutor>,
    ) -> ServerResult<bool> {
        let _admin = self.admin.lock().await;

        let ready =
            main.is_merging() && main.is_stopped() && temp.is_merging() && temp.is_stopped();
        if !ready {
            debug!(
                main = %main.task_name(),
                temp = %temp.task_name(),
                main_state = %main.state(),
                temp_state = %temp.state(),
                "Merge participants not ready"
            );
            return Ok(false);
        }

        let main_task = main.instance_task();
        let temp_task = temp.instance_task();
        if !main_task.is_main() || temp_task.is_main() {
            return Err(self.contract(format!(
                "merge expects a main and a temporary task, got {} and {}",
                main_task, temp_task
            )));
        }
        if main_task.instance() != temp_task.instance() {
            return Err(self.contract(format!(
                "cannot merge tasks of different instances: {} and {}",
                main_task, temp_task
            )));
        }
        self.ensure_registered(main)?;
        self.ensure_registered(temp)?;

        let temp_name = temp.task_name();
        info!(main = %main.task_name(), temp = %temp_name, "Merging temporary task");

        // Already stopped; this also waits for both worker slots
        self.stop(main).await?;
        self.stop(temp).await?;

        let merged = self.build(main_task.merged(temp_task))?;
        self.start(&merged).await?;

        self.unregister_task(&temp_name).await;
        self.register_task(&merged);
        self.clear_task(&temp_name).await?;

        info!(task = %merged.instance_task(), "Merged temporary task");
        Ok(true)
    }

    /// Promote a temporary task to its instance's main task. The binlog
    /// position record moves with it, so the new main task resumes where the
    /// temporary one stopped.
    ///
    /// Does nothing and returns `false` if the task is already main.
    pub async fn upgrade(&self, executor: &Arc<dyn TaskExecutor>) -> ServerResult<bool> {
        let _admin = self.admin.lock().await;

        let task = executor.instance_task();
        if task.is_main() {
            debug!(task = %executor.task_name(), "Task is already main");
            return Ok(false);
        }
        self.ensure_registered(executor)?;
        if self.main_executors().contains_key(task.instance()) {
            return Err(ServerError::conflict(format!(
                "instance {} already has a main task",
                task.instance()
            )));
        }

        let old_name = executor.task_name();
        info!(task = %old_name, "Upgrading temporary task");

        self.stop(executor).await?;
        let promoted = task.promoted();
        let new_name = promoted.task_name();
        let upgraded = self.build(promoted)?;

        self.holder.rename(&old_name, &new_name).await?;
        self.holder.remove(&old_name).await?;
        if let Err(e) = self.start(&upgraded).await {
            if let Err(restore) = self.holder.rename(&new_name, &old_name).await {
                warn!(task = %old_name, error = %restore, "Failed to restore binlog position record");
            }
            return Err(e);
        }

        self.unregister_task(&old_name).await;
        self.register_task(&upgraded);

        info!(from = %old_name, to = %new_name, "Upgraded temporary task");
        Ok(true)
    }

    /// Gracefully stop every executor. The mapping is left unchanged.
    pub async fn shutdown(&self) -> ServerResult<()> {
        let _admin = self.admin.lock().await;
        let executors = self.distinct_executors();
        info!(executors = executors.len(), "Shutting down task container");

        let mut first_error = None;
        for executor in executors {
            if let Err(e) = self.stop(&executor).await {
                error!(task = %executor.task_name(), error = %e, "Failed to stop executor");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn create_database_locked(
        &self,
        database_task: DatabaseTask,
    ) -> ServerResult<Arc<dyn TaskExecutor>> {
        let database = database_task.database().to_string();
        info!(database = %database, "Creating database task");

        if self.executor(&database).is_some() {
            return Err(ServerError::conflict(format!("{} is already served", database)));
        }
        let instance = self.resolver.resolve(&database).await?;
        let is_main = self.count(&instance) == 0;
        let task = InstanceTask::new(instance, is_main, [database_task]);
        task.validate_names().map_err(|msg| self.contract(msg))?;

        let executor = self.build(task)?;
        self.start(&executor).await?;
        self.register_task(&executor);
        self.announce(&database).await?;

        info!(
            database = %database,
            task = %executor.task_name(),
            main = is_main,
            "Created database task"
        );
        Ok(executor)
    }

    async fn remove_locked(&self, database: &str) -> ServerResult<()> {
        info!(database = %database, "Removing database task");

        let executor = self.find_executor(database)?;
        let old_name = executor.task_name();
        self.stop(&executor).await?;

        let remaining = executor.instance_task().without(database);
        let replacement = if remaining.is_empty() {
            None
        } else {
            let new_name = remaining.task_name();
            let rebuilt = self.build(remaining)?;
            let renamed = new_name != old_name;
            if renamed {
                self.holder.rename(&old_name, &new_name).await?;
            }
            if let Err(e) = self.start(&rebuilt).await {
                if renamed {
                    if let Err(restore) = self.holder.rename(&new_name, &old_name).await {
                        warn!(task = %old_name, error = %restore, "Failed to restore binlog position record");
                    }
                }
                return Err(e);
            }
            Some(rebuilt)
        };

        self.unregister_database(database);
        self.unregister_task(&old_name).await;
        match &replacement {
            Some(rebuilt) => self.register_task(rebuilt),
            None => self.clear_task(&old_name).await?,
        }
        self.clear_database(database)?;
        self.retract(database).await?;

        info!(
            database = %database,
            task = ?replacement.as_ref().map(|e| e.task_name()),
            "Removed database task"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn distinct_executors(&self) -> Vec<Arc<dyn TaskExecutor>> {
        let executors = self.executors.read();
        let mut seen = HashSet::new();
        executors
            .values()
            .filter(|e| seen.insert(e.task_name()))
            .cloned()
            .collect()
    }

    fn contract(&self, msg: String) -> ServerError {
        error!(error = %msg, "Contract violation");
        ServerError::ContractViolation(msg)
    }

    fn find_executor(&self, database: &str) -> ServerResult<Arc<dyn TaskExecutor>> {
        self.executor(database)
            .ok_or_else(|| self.contract(format!("no executor serves {}", database)))
    }

    /// Every database of `executor` must currently map to this very
    /// executor, not merely to one with the same task name.
    fn ensure_registered(&self, executor: &Arc<dyn TaskExecutor>) -> ServerResult<()> {
        let executors = self.executors.read();
        let registered = executor.instance_task().databases().all(|database| {
            executors
                .get(database)
                .is_some_and(|e| same_executor(e, executor))
        });
        drop(executors);

        if registered {
            Ok(())
        } else {
            Err(self.contract(format!(
                "executor {} is not registered",
                executor.task_name()
            )))
        }
    }

    fn check_admission(&self, task: &InstanceTask) -> ServerResult<()> {
        if task.is_empty() {
            return Err(self.contract(format!("instance task {} has no databases", task)));
        }
        task.validate_names().map_err(|msg| self.contract(msg))?;
        if let Some(database) = task.databases().find(|d| self.executor(d).is_some()) {
            return Err(ServerError::conflict(format!("{} is already served", database)));
        }
        if task.is_main() && self.main_executors().contains_key(task.instance()) {
            return Err(ServerError::conflict(format!(
                "instance {} already has a main task",
                task.instance()
            )));
        }
        Ok(())
    }

    fn build(&self, task: InstanceTask) -> ServerResult<Arc<dyn TaskExecutor>> {
        let task_name = task.task_name();
        self.builder.build(task).map_err(|e| match e {
            ServerError::StartupFailure { .. } => e,
            other => ServerError::startup(task_name, other),
        })
    }

    /// Submit to the pool. On failure the executor is stopped so it releases
    /// its storage.
    async fn start(&self, executor: &Arc<dyn TaskExecutor>) -> ServerResult<()> {
        if let Err(e) = self.pool.execute(Arc::clone(executor)) {
            if let Err(stop) = executor.stop().await {
                warn!(task = %executor.task_name(), error = %stop, "Failed to release unstarted executor");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop `executor` and wait until its worker slot is free again.
    async fn stop(&self, executor: &Arc<dyn TaskExecutor>) -> ServerResult<()> {
        executor.stop().await.map_err(|e| match e {
            ServerError::ShutdownFailure { .. } => e,
            other => ServerError::shutdown(executor.task_name(), other),
        })?;
        self.pool.join(executor).await;
        Ok(())
    }

    fn register_task(&self, executor: &Arc<dyn TaskExecutor>) {
        let mut executors = self.executors.write();
        for database in executor.instance_task().databases() {
            executors.insert(database.to_string(), Arc::clone(executor));
        }
        debug!(task = %executor.task_name(), "Registered task");
    }

    /// Drop every mapping entry of `task_name` and purge its fleet status.
    async fn unregister_task(&self, task_name: &str) {
        self.executors
            .write()
            .retain(|_, executor| executor.task_name() != task_name);

        if let Err(e) = self.status.delete_server(task_name).await {
            warn!(task = %task_name, error = %e, "Failed to delete fleet status");
        }
        debug!(task = %task_name, "Unregistered task");
    }

    fn unregister_database(&self, database: &str) {
        self.executors.write().remove(database);
    }

    fn clear_database(&self, database: &str) -> ServerResult<()> {
        self.storage.delete(database)?;
        Ok(())
    }

    async fn clear_task(&self, task_name: &str) -> ServerResult<()> {
        self.holder.remove(task_name).await?;
        Ok(())
    }

    async fn announce(&self, database: &str) -> ServerResult<()> {
        retry(&self.retry, "register", || {
            self.registry.register(&self.host, database)
        })
        .await
        .inspect_err(|e| {
            error!(database = %database, host = %self.host, error = %e, "Failed to announce database");
        })
    }

    async fn retract(&self, database: &str) -> ServerResult<()> {
        retry(&self.retry, "unregister", || {
            self.registry.unregister(&self.host, database)
        })
        .await
        .inspect_err(|e| {
            error!(database = %database, host = %self.host, error = %e, "Failed to retract database");
        })
    }
}
