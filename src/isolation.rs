//! Transaction isolation levels

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Read/write visibility contract requested when a transaction is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL keywords for the level, e.g. `READ COMMITTED`
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Statement issued as the first statement of every transaction
    pub fn statement(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown isolation level: {0:?}")]
pub struct ParseIsolationLevelError(String);

impl FromStr for IsolationLevel {
    type Err = ParseIsolationLevelError;

    /// Accepts `read committed`, `read_committed`, `READ-COMMITTED` and so on
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '_' | '-' => ' ',
                c => c.to_ascii_lowercase(),
            })
            .collect();

        match normalized.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["read", "committed"] => Ok(IsolationLevel::ReadCommitted),
            ["repeatable", "read"] => Ok(IsolationLevel::RepeatableRead),
            ["serializable"] => Ok(IsolationLevel::Serializable),
            _ => Err(ParseIsolationLevelError(s.to_string())),
        }
    }
}
