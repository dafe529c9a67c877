//! Captured change events
//!
//! The row images are opaque bytes: the binlog reader decides their encoding,
//! storage only frames and orders them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BinlogInfo;

/// Kind of captured mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
    /// Schema-level statement (CREATE/ALTER/DROP ...)
    Ddl,
}

/// One row-level or schema-level mutation read from the binlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Database the mutation belongs to
    pub database: String,
    /// Table name (empty for database-wide DDL)
    pub table: String,
    pub op: ChangeOp,
    /// Replication position the event was read at
    pub binlog_info: BinlogInfo,
    /// MySQL server id of the originating server
    pub server_id: u64,
    /// Event timestamp from the binlog header
    pub timestamp: DateTime<Utc>,
    /// Previous row image (UPDATE/DELETE)
    pub before: Option<Bytes>,
    /// New row image (INSERT/UPDATE) or statement text (DDL)
    pub after: Option<Bytes>,
}

impl ChangeEvent {
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        op: ChangeOp,
        binlog_info: BinlogInfo,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            op,
            binlog_info,
            server_id: 0,
            timestamp: Utc::now(),
            before: None,
            after: None,
        }
    }

    pub fn insert(
        database: impl Into<String>,
        table: impl Into<String>,
        binlog_info: BinlogInfo,
        row: impl Into<Bytes>,
    ) -> Self {
        Self::new(database, table, ChangeOp::Insert, binlog_info).with_after(row)
    }

    pub fn ddl(database: impl Into<String>, binlog_info: BinlogInfo, sql: &str) -> Self {
        Self::new(database, "", ChangeOp::Ddl, binlog_info)
            .with_after(Bytes::copy_from_slice(sql.as_bytes()))
    }

    pub fn with_before(mut self, row: impl Into<Bytes>) -> Self {
        self.before = Some(row.into());
        self
    }

    pub fn with_after(mut self, row: impl Into<Bytes>) -> Self {
        self.after = Some(row.into());
        self
    }

    pub fn with_server_id(mut self, server_id: u64) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
