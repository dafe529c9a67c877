//! Orchestration errors
//!
//! Structural operations (`create`, `remove`, `merge`, `upgrade`) surface
//! every failure to their caller. Failures inside a running executor never
//! reach this type; they are logged where the executor's future completes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Caller bug: unknown database or executor, mismatched merge participants
    Contract,
    /// Request conflicts with current orchestrator state
    Conflict,
    /// Executor or pool could not start or stop
    Lifecycle,
    /// Registry or instance resolution failed
    External,
    /// Storage or position persistence failed
    Storage,
    /// Invalid settings
    Configuration,
    Other,
}

#[derive(Error, Debug)]
pub enum ServerError {
    /// Operation on a database or executor the container does not know
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Database already served, or a second main task for one instance
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Failed to start {task}: {reason}")]
    StartupFailure { task: String, reason: String },

    #[error("Failed to stop {task}: {reason}")]
    ShutdownFailure { task: String, reason: String },

    #[error("Registry error: {0}")]
    Registry(String),

    /// Owning instance of a database could not be resolved
    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rill_core::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn startup(task: impl Into<String>, reason: impl ToString) -> Self {
        Self::StartupFailure {
            task: task.into(),
            reason: reason.to_string(),
        }
    }

    pub fn shutdown(task: impl Into<String>, reason: impl ToString) -> Self {
        Self::ShutdownFailure {
            task: task.into(),
            reason: reason.to_string(),
        }
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ContractViolation(_) => ErrorCategory::Contract,
            Self::Conflict(_) | Self::InvalidState(_) => ErrorCategory::Conflict,
            Self::StartupFailure { .. } | Self::ShutdownFailure { .. } => ErrorCategory::Lifecycle,
            Self::Registry(_) | Self::Resolution(_) => ErrorCategory::External,
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Config(_) | Self::Yaml(_) => ErrorCategory::Configuration,
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Registry(_) | Self::Resolution(_) => true,
            Self::Storage(e) => e.is_retriable(),
            _ => false,
        }
    }
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;
