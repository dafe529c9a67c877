//! Logical MySQL replication positions
//!
//! A [`BinlogInfo`] names a point in the replication stream independently of
//! how the captured events are laid out on disk. Formats as
//! `mysql-bin.000003:12345`, with a trailing `+` when the next position is to
//! be skipped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Resumable cursor into a binlog stream. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogInfo {
    binlog_file: String,
    binlog_position: u64,
    skip_to_next_pos: bool,
}

impl BinlogInfo {
    pub fn new(binlog_file: impl Into<String>, binlog_position: u64) -> Self {
        Self {
            binlog_file: binlog_file.into(),
            binlog_position,
            skip_to_next_pos: false,
        }
    }

    /// Same position, flagged so that resuming starts after it.
    pub fn skipping_next(&self) -> Self {
        Self {
            skip_to_next_pos: true,
            ..self.clone()
        }
    }

    /// Same position with the skip flag cleared.
    pub fn at(&self) -> Self {
        Self {
            skip_to_next_pos: false,
            ..self.clone()
        }
    }

    pub fn binlog_file(&self) -> &str {
        &self.binlog_file
    }

    pub fn binlog_position(&self) -> u64 {
        self.binlog_position
    }

    pub fn skip_to_next_pos(&self) -> bool {
        self.skip_to_next_pos
    }
}

impl fmt::Display for BinlogInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.binlog_file, self.binlog_position)?;
        if self.skip_to_next_pos {
            write!(f, "+")?;
        }
        Ok(())
    }
}

impl FromStr for BinlogInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (body, skip) = match s.strip_suffix('+') {
            Some(body) => (body, true),
            None => (s, false),
        };
        let (file, pos) = body
            .rsplit_once(':')
            .ok_or_else(|| Error::Other(format!("Invalid binlog position: {}", s)))?;
        if file.is_empty() {
            return Err(Error::Other(format!("Missing binlog file in: {}", s)));
        }
        let position = pos
            .parse::<u64>()
            .map_err(|e| Error::Other(format!("Invalid binlog offset in {}: {}", s, e)))?;

        let info = BinlogInfo::new(file, position);
        Ok(if skip { info.skipping_next() } else { info })
    }
}
