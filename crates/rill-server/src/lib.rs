//! # rill-server - Replication task orchestration
//!
//! Tracks which executor serves which database and restructures instance
//! tasks as databases come and go:
//!
//! ```text
//!   create(db) ──► temp task ──caught up──► merge ──► main task
//!                      │                                 ▲
//!                      └──── no main yet ──► upgrade ────┘
//! ```
//!
//! Executors write each database's events through `rill-core` storage; any
//! number of read channels can follow that storage independently.

pub mod builder;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod source;
pub mod task;

pub use builder::{DefaultTaskBuilder, TaskBuilder};
pub use config::{ExecutorConfig, PoolConfig, RegistryRetryConfig, ServerConfig};
pub use container::{ContainerServices, TaskContainer};
pub use error::{ErrorCategory, ServerError, ServerResult};
pub use executor::{DefaultTaskExecutor, ExecutorState, TaskExecutor};
pub use pool::ExecutorPool;
pub use registry::{
    InstanceResolver, MemoryInstanceResolver, MemoryRegistry, MemoryStatusRegistry, RegistryCall,
    RegistryService, StatusRegistry,
};
pub use source::{BinlogSource, MemoryBinlog, SourceFactory};
pub use task::{DatabaseTask, InstanceTask};
