use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical storage coordinate of one data record.
///
/// Ordered by segment number, then by byte offset of the record frame inside
/// the segment. Segment numbers only grow, so append order and `Ord` agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sequence {
    segment: u64,
    offset: u64,
}

impl Sequence {
    pub const ZERO: Sequence = Sequence {
        segment: 0,
        offset: 0,
    };

    pub fn new(segment: u64, offset: u64) -> Self {
        Self { segment, offset }
    }

    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// First record of the following segment.
    pub fn next_segment(&self) -> Self {
        Self {
            segment: self.segment + 1,
            offset: 0,
        }
    }

    pub(crate) fn advance(&self, bytes: u64) -> Self {
        Self {
            segment: self.segment,
            offset: self.offset + bytes,
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020}:{}", self.segment, self.offset)
    }
}
