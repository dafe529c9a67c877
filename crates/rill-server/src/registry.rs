//! External services consumed by the orchestrator
//!
//! The registry, instance resolution, and fleet status store are owned by
//! other systems. Only their interfaces live here, with in-memory versions
//! for tests and single-node use.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::{ServerError, ServerResult};

/// Announces which process serves which database.
#[async_trait]
pub trait RegistryService: Send + Sync {
    async fn register(&self, host: &str, database: &str) -> ServerResult<()>;

    async fn unregister(&self, host: &str, database: &str) -> ServerResult<()>;
}

/// Maps a database to the MySQL instance that hosts it.
#[async_trait]
pub trait InstanceResolver: Send + Sync {
    async fn resolve(&self, database: &str) -> ServerResult<String>;
}

/// Fleet-wide status records keyed by task name.
#[async_trait]
pub trait StatusRegistry: Send + Sync {
    async fn delete_server(&self, task_name: &str) -> ServerResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Register { host: String, database: String },
    Unregister { host: String, database: String },
}

#[derive(Debug, Default)]
struct RegistryState {
    owners: HashMap<String, String>,
    calls: Vec<RegistryCall>,
    failures: u32,
}

/// In-memory registry recording every call.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures = n;
    }

    pub fn calls(&self) -> Vec<RegistryCall> {
        self.state.lock().calls.clone()
    }

    /// Host currently announced for `database`.
    pub fn owner(&self, database: &str) -> Option<String> {
        self.state.lock().owners.get(database).cloned()
    }

    fn record(&self, call: RegistryCall) -> ServerResult<()> {
        let mut state = self.state.lock();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(ServerError::registry("registry unavailable"));
        }
        match &call {
            RegistryCall::Register { host, database } => {
                state.owners.insert(database.clone(), host.clone());
            }
            RegistryCall::Unregister { host, database } => {
                if state.owners.get(database) == Some(host) {
                    state.owners.remove(database);
                }
            }
        }
        state.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl RegistryService for MemoryRegistry {
    async fn register(&self, host: &str, database: &str) -> ServerResult<()> {
        self.record(RegistryCall::Register {
            host: host.to_string(),
            database: database.to_string(),
        })
    }

    async fn unregister(&self, host: &str, database: &str) -> ServerResult<()> {
        self.record(RegistryCall::Unregister {
            host: host.to_string(),
            database: database.to_string(),
        })
    }
}

/// Static database-to-instance mapping.
#[derive(Debug, Default)]
pub struct MemoryInstanceResolver {
    instances: Mutex<HashMap<String, String>>,
}

impl MemoryInstanceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(self, database: impl Into<String>, instance: impl Into<String>) -> Self {
        self.insert(database, instance);
        self
    }

    pub fn insert(&self, database: impl Into<String>, instance: impl Into<String>) {
        self.instances.lock().insert(database.into(), instance.into());
    }
}

#[async_trait]
impl InstanceResolver for MemoryInstanceResolver {
    async fn resolve(&self, database: &str) -> ServerResult<String> {
        self.instances
            .lock()
            .get(database)
            .cloned()
            .ok_or_else(|| ServerError::resolution(format!("no instance hosts {}", database)))
    }
}

/// In-memory fleet status store.
#[derive(Debug, Default)]
pub struct MemoryStatusRegistry {
    servers: Mutex<HashSet<String>>,
    deleted: Mutex<Vec<String>>,
}

impl MemoryStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_server(&self, task_name: impl Into<String>) {
        self.servers.lock().insert(task_name.into());
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.servers.lock().contains(task_name)
    }

    /// Task names passed to `delete_server`, in call order.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl StatusRegistry for MemoryStatusRegistry {
    async fn delete_server(&self, task_name: &str) -> ServerResult<()> {
        self.servers.lock().remove(task_name);
        self.deleted.lock().push(task_name.to_string());
        Ok(())
    }
}
