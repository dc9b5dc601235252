//! Transaction isolation levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Isolation level of a transaction.
///
/// | Level             | Snapshot          | Extra checks                  |
/// |-------------------|-------------------|-------------------------------|
/// | `ReadUncommitted` | per statement     | sees uncommitted heads        |
/// | `ReadCommitted`   | per statement     | none                          |
/// | `RepeatableRead`  | per transaction   | none (last writer wins)       |
/// | `Serializable`    | per transaction   | read/write set validation     |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Sees data committed before each statement starts.
    #[default]
    ReadCommitted,
    /// Sees data committed before the transaction starts.
    RepeatableRead,
    /// Repeatable read plus first-committer-wins validation at commit.
    Serializable,
}

impl IsolationLevel {
    /// Returns true if a fresh snapshot is taken for every statement.
    #[must_use]
    pub const fn snapshot_per_statement(self) -> bool {
        matches!(self, Self::ReadUncommitted | Self::ReadCommitted)
    }

    /// Returns true if reads must be tracked for commit validation.
    #[must_use]
    pub const fn tracks_reads(self) -> bool {
        matches!(self, Self::Serializable)
    }

    /// Returns the SQL name of the level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown isolation level name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown isolation level: {0}")]
pub struct ParseIsolationError(String);

impl FromStr for IsolationLevel {
    type Err = ParseIsolationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "read uncommitted" => Ok(Self::ReadUncommitted),
            "read committed" => Ok(Self::ReadCommitted),
            "repeatable read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            _ => Err(ParseIsolationError(s.to_string())),
        }
    }
}
