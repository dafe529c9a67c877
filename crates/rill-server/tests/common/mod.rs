//! Shared fixtures for container integration tests

#![allow(dead_code)]

use rill_core::{
    BinlogInfo, BinlogInfoHolder, ChangeEvent, Error, FileBinlogInfoHolder, LifeCycle,
    ReadChannel, StorageConfig,
};
use rill_server::{
    ContainerServices, MemoryBinlog, MemoryInstanceResolver, MemoryRegistry,
    MemoryStatusRegistry, RegistryRetryConfig, ServerConfig, TaskContainer, TaskExecutor,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rill_server=debug".parse().unwrap())
                    .add_directive("rill_core=info".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const HOST: &str = "rill-test";
pub const BINLOG_FILE: &str = "mysql-bin.000001";

/// A container wired to in-memory collaborators over a temporary data dir.
pub struct Harness {
    pub dir: TempDir,
    pub config: ServerConfig,
    pub registry: Arc<MemoryRegistry>,
    pub resolver: Arc<MemoryInstanceResolver>,
    pub status: Arc<MemoryStatusRegistry>,
    pub holder: Arc<FileBinlogInfoHolder>,
    pub binlog: MemoryBinlog,
    pub container: TaskContainer,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|config| config).await
    }

    /// Harness whose config is adjusted by `f` before the container is built.
    pub async fn with_config(f: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        init_test_logging();
        let dir = TempDir::new().unwrap();

        let mut config = ServerConfig::default()
            .with_host(HOST)
            .with_storage(
                StorageConfig::new()
                    .with_data_dir(dir.path().join("data"))
                    .with_fsync(false),
            );
        config.positions_dir = Some(dir.path().join("positions"));
        config.executor.poll_interval_ms = 5;
        config.executor.checkpoint_interval = 1;
        config.registry = RegistryRetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        };
        let config = f(config);

        let registry = Arc::new(MemoryRegistry::new());
        let resolver = Arc::new(
            MemoryInstanceResolver::new()
                .with_database("orders", "db01")
                .with_database("users", "db01")
                .with_database("products", "db01")
                .with_database("billing", "db02"),
        );
        let status = Arc::new(MemoryStatusRegistry::new());
        let holder = Arc::new(
            FileBinlogInfoHolder::with_options(config.positions_dir(), false)
                .await
                .unwrap(),
        );
        let binlog = MemoryBinlog::new();

        let services = ContainerServices {
            registry: registry.clone(),
            resolver: resolver.clone(),
            status: status.clone(),
            holder: holder.clone(),
            source_factory: Arc::new(binlog.clone()),
        };
        let container = TaskContainer::new(&config, services).unwrap();

        Self {
            dir,
            config,
            registry,
            resolver,
            status,
            holder,
            binlog,
            container,
        }
    }

    /// The harness collaborators, for building another container over them.
    pub fn services(&self) -> ContainerServices {
        ContainerServices {
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            status: self.status.clone(),
            holder: self.holder.clone(),
            source_factory: Arc::new(self.binlog.clone()),
        }
    }

    /// Append an insert for `database` at `position` to `instance`'s binlog.
    pub fn push(&self, instance: &str, database: &str, position: u64) {
        let event = ChangeEvent::insert(
            database,
            "t",
            BinlogInfo::new(BINLOG_FILE, position),
            format!("row-{}", position).into_bytes(),
        );
        self.binlog.push(instance, event);
    }

    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.config.storage.database_dir(database)
    }

    pub async fn position(&self, task_name: &str) -> Option<BinlogInfo> {
        self.holder.get(task_name).await.unwrap()
    }

    /// Binlog positions stored for `database`, oldest first.
    pub fn stored_positions(&self, database: &str) -> Vec<u64> {
        let mut channel = self.container.read_channel(database).unwrap();
        read_positions(&mut channel)
    }

    /// Wait until exactly `expected` positions are stored for `database`.
    pub async fn wait_for_positions(&self, database: &str, expected: &[u64]) {
        let this = self;
        let reached =
            wait_until(|| async move { this.stored_positions(database) == expected }).await;
        assert!(
            reached,
            "{} stored {:?}, expected {:?}",
            database,
            self.stored_positions(database),
            expected
        );
    }

    /// Wait until `task_name`'s record resumes just after `position`.
    pub async fn wait_for_checkpoint(&self, task_name: &str, position: u64) {
        let expected = BinlogInfo::new(BINLOG_FILE, position).skipping_next();
        let this = self;
        let wanted = &expected;
        let reached =
            wait_until(|| async move { this.position(task_name).await.as_ref() == Some(wanted) })
                .await;
        assert!(
            reached,
            "{} checkpoint is {:?}, expected {}",
            task_name,
            self.position(task_name).await,
            expected
        );
    }

    /// Every served database maps to an executor whose task contains it, every
    /// task's databases all map back to it, and no database is in two tasks.
    pub fn assert_mapping_consistent(&self) {
        let databases = self.container.database_tasks();
        let mut executors: Vec<Arc<dyn TaskExecutor>> =
            self.container.main_executors().into_values().collect();
        executors.extend(self.container.temp_executors().into_values().flatten());

        let mut covered = 0;
        for executor in &executors {
            for database in executor.instance_task().databases() {
                let mapped = self
                    .container
                    .executor(database)
                    .unwrap_or_else(|| panic!("{} is not mapped", database));
                assert_eq!(mapped.task_name(), executor.task_name());
                covered += 1;
            }
        }
        assert_eq!(covered, databases.len(), "a database belongs to two tasks");

        for database in databases.keys() {
            let executor = self.container.executor(database).unwrap();
            assert!(executor.instance_task().contains(database));
        }
    }
}

/// Drain a fresh read channel from the oldest event.
pub fn read_positions<C: ReadChannel>(channel: &mut C) -> Vec<u64> {
    channel.start().unwrap();
    match channel.open_oldest() {
        Ok(()) => {}
        Err(Error::NotFound(_)) => return Vec::new(),
        Err(e) => panic!("open_oldest failed: {}", e),
    }

    let mut positions = Vec::new();
    loop {
        match channel.next() {
            Ok(event) => positions.push(event.binlog_info.binlog_position()),
            Err(Error::EndOfStream) => break,
            Err(e) => panic!("read failed: {}", e),
        }
    }
    channel.stop().unwrap();
    positions
}

/// Poll `condition` every few milliseconds for up to five seconds.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
