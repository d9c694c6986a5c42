//! Controller configuration, read from the environment with sane defaults

use std::env;
use std::time::Duration;

use crate::isolation::IsolationLevel;

pub const DEFAULT_RETRY_LIMIT: u32 = 5;
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_REPLAY_BYTES: usize = 2 * 1024 * 1024; // 2 MB of buffered request body

/// Defaults applied to every `begin` stage unless overridden on the stage itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxConfig {
    /// Isolation level used when the stage does not pick one
    pub isolation: IsolationLevel,
    /// Total attempts per request, including the first
    pub retry_limit: u32,
    /// Upper bound on how long a scope may stay pending
    pub deadline: Duration,
    /// Largest request body buffered so the chain can be replayed on retry
    pub max_replay_bytes: usize,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            deadline: DEFAULT_DEADLINE,
            max_replay_bytes: DEFAULT_MAX_REPLAY_BYTES,
        }
    }
}

impl TxConfig {
    /// Read `TX_ISOLATION_LEVEL`, `TX_RETRY_LIMIT`, `TX_DEADLINE_SECS` and
    /// `TX_MAX_REPLAY_BYTES`. Missing or invalid values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let isolation = lookup("TX_ISOLATION_LEVEL")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.isolation);

        let retry_limit = lookup("TX_RETRY_LIMIT")
            .and_then(|s| s.trim().parse().ok())
            .filter(|v: &u32| *v > 0)
            .unwrap_or(defaults.retry_limit);

        let deadline = lookup("TX_DEADLINE_SECS")
            .and_then(|s| s.trim().parse().ok())
            .filter(|v: &u64| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.deadline);

        let max_replay_bytes = lookup("TX_MAX_REPLAY_BYTES")
            .and_then(|s| s.trim().parse().ok())
            .filter(|v: &usize| *v > 0)
            .unwrap_or(defaults.max_replay_bytes);

        Self {
            isolation,
            retry_limit,
            deadline,
            max_replay_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        assert_eq!(TxConfig::from_lookup(|_| None), TxConfig::default());
    }

    #[test]
    fn test_values_are_parsed() {
        let config = TxConfig::from_lookup(lookup_from(&[
            ("TX_ISOLATION_LEVEL", "serializable"),
            ("TX_RETRY_LIMIT", "3"),
            ("TX_DEADLINE_SECS", "5"),
            ("TX_MAX_REPLAY_BYTES", "1024"),
        ]));

        assert_eq!(config.isolation, IsolationLevel::Serializable);
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.deadline, Duration::from_secs(5));
        assert_eq!(config.max_replay_bytes, 1024);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = TxConfig::from_lookup(lookup_from(&[
            ("TX_ISOLATION_LEVEL", "chaos"),
            ("TX_RETRY_LIMIT", "0"),
            ("TX_DEADLINE_SECS", "soon"),
        ]));

        assert_eq!(config, TxConfig::default());
    }
}
