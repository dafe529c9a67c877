//! Replication task model
//!
//! An [`InstanceTask`] streams one MySQL instance's binlog into the storage of
//! the databases it owns. Exactly one main task per instance carries the
//! steady-state stream; temporary tasks let a newly admitted database catch up
//! before being folded into (merge) or promoted to (upgrade) the main task.
//!
//! Tasks are immutable snapshots: structural changes produce a new task, and
//! the orchestrator builds a new executor for it.

use serde::{Deserialize, Serialize};
use std::fmt;

const TEMP_MARKER: &str = "-tmp-";
const DATABASE_SEPARATOR: &str = "+";

/// The smallest schedulable unit: one database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseTask {
    database: String,
}

impl DatabaseTask {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

impl fmt::Display for DatabaseTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.database)
    }
}

impl From<&str> for DatabaseTask {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTask {
    instance: String,
    is_main: bool,
    database_tasks: Vec<DatabaseTask>,
}

impl InstanceTask {
    /// Duplicate databases are dropped, keeping the first occurrence.
    pub fn new(
        instance: impl Into<String>,
        is_main: bool,
        database_tasks: impl IntoIterator<Item = DatabaseTask>,
    ) -> Self {
        let mut deduped: Vec<DatabaseTask> = Vec::new();
        for task in database_tasks {
            if !deduped.contains(&task) {
                deduped.push(task);
            }
        }
        Self {
            instance: instance.into(),
            is_main,
            database_tasks: deduped,
        }
    }

    pub fn main(
        instance: impl Into<String>,
        database_tasks: impl IntoIterator<Item = DatabaseTask>,
    ) -> Self {
        Self::new(instance, true, database_tasks)
    }

    pub fn temp(
        instance: impl Into<String>,
        database_tasks: impl IntoIterator<Item = DatabaseTask>,
    ) -> Self {
        Self::new(instance, false, database_tasks)
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub fn database_tasks(&self) -> &[DatabaseTask] {
        &self.database_tasks
    }

    pub fn databases(&self) -> impl Iterator<Item = &str> + '_ {
        self.database_tasks.iter().map(DatabaseTask::database)
    }

    pub fn contains(&self, database: &str) -> bool {
        self.databases().any(|d| d == database)
    }

    pub fn size(&self) -> usize {
        self.database_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.database_tasks.is_empty()
    }

    /// Identity of the task and key of its binlog position record.
    ///
    /// Main tasks are named after their instance, so adding or removing
    /// databases keeps the record. Temporary tasks are named
    /// `<instance>-tmp-<db1>+<db2>...`.
    pub fn task_name(&self) -> String {
        if self.is_main {
            self.instance.clone()
        } else {
            let databases: Vec<&str> = self.databases().collect();
            format!(
                "{}{}{}",
                self.instance,
                TEMP_MARKER,
                databases.join(DATABASE_SEPARATOR)
            )
        }
    }

    /// Check that the task name is unambiguous: instance names may not
    /// contain `-tmp-` and database names may not contain `+`.
    pub fn validate_names(&self) -> Result<(), String> {
        if self.instance.is_empty() || self.instance.contains(TEMP_MARKER) {
            return Err(format!("invalid instance name: {:?}", self.instance));
        }
        if let Some(database) = self
            .databases()
            .find(|d| d.is_empty() || d.contains(DATABASE_SEPARATOR))
        {
            return Err(format!("invalid database name: {:?}", database));
        }
        Ok(())
    }

    /// This task without `database`.
    pub fn without(&self, database: &str) -> Self {
        Self {
            instance: self.instance.clone(),
            is_main: self.is_main,
            database_tasks: self
                .database_tasks
                .iter()
                .filter(|t| t.database() != database)
                .cloned()
                .collect(),
        }
    }

    /// This task with `other`'s databases appended.
    pub fn merged(&self, other: &InstanceTask) -> Self {
        Self::new(
            self.instance.clone(),
            self.is_main,
            self.database_tasks
                .iter()
                .chain(other.database_tasks.iter())
                .cloned(),
        )
    }

    /// This task flagged as the instance's main task.
    pub fn promoted(&self) -> Self {
        Self {
            is_main: true,
            ..self.clone()
        }
    }
}

impl fmt::Display for InstanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let databases: Vec<&str> = self.databases().collect();
        write!(
            f,
            "{}[{}]({})",
            self.task_name(),
            if self.is_main { "main" } else { "temp" },
            databases.join(",")
        )
    }
}
