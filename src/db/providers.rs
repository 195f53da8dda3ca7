//! Lookup policies keyed by connection key: connection strings and command timeouts.

use crate::error::{DbError, DbResult};
use crate::models::DEFAULT_COMMAND_TIMEOUT_SECS;
use std::collections::HashMap;
use std::time::Duration;

/// Maps a connection key to a connection string.
pub trait ConnectionStringProvider: Send + Sync {
    /// Fails with [`DbError::ConnectionStringNotFound`] for unknown keys.
    fn lookup(&self, connection_key: &str) -> DbResult<String>;
}

/// Connection strings known up front (CLI arguments, configuration files).
#[derive(Debug, Clone, Default)]
pub struct ConfiguredConnectionStrings {
    entries: HashMap<String, String>,
}

impl ConfiguredConnectionStrings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, connection_string: impl Into<String>) -> Self {
        self.insert(key, connection_string);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, connection_string: impl Into<String>) {
        self.entries.insert(key.into(), connection_string.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl ConnectionStringProvider for ConfiguredConnectionStrings {
    fn lookup(&self, connection_key: &str) -> DbResult<String> {
        self.entries
            .get(connection_key)
            .cloned()
            .ok_or_else(|| DbError::connection_string_not_found(connection_key))
    }
}

impl FromIterator<(String, String)> for ConfiguredConnectionStrings {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Default prefix for [`EnvConnectionStrings`].
pub const DEFAULT_ENV_PREFIX: &str = "AMBIENT_DB_";

/// Reads `<PREFIX><KEY>` from the process environment.
///
/// The key is upper-cased and every character outside `[A-Z0-9_]` becomes `_`,
/// so `orders-db` resolves `AMBIENT_DB_ORDERS_DB`.
#[derive(Debug, Clone)]
pub struct EnvConnectionStrings {
    prefix: String,
}

impl EnvConnectionStrings {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_ENV_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, connection_key: &str) -> String {
        let suffix: String = connection_key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvConnectionStrings {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStringProvider for EnvConnectionStrings {
    fn lookup(&self, connection_key: &str) -> DbResult<String> {
        std::env::var(self.variable_name(connection_key))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| DbError::connection_string_not_found(connection_key))
    }
}

/// Command timeout policy. [`Duration::ZERO`] means "no timeout".
pub trait CommandTimeoutProvider: Send + Sync {
    fn lookup(&self, connection_key: &str) -> Duration;
}

/// The same timeout for every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedCommandTimeout(pub Duration);

impl FixedCommandTimeout {
    pub fn thirty_seconds() -> Self {
        Self(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS))
    }

    pub fn infinite() -> Self {
        Self(Duration::ZERO)
    }
}

impl Default for FixedCommandTimeout {
    fn default() -> Self {
        Self::thirty_seconds()
    }
}

impl CommandTimeoutProvider for FixedCommandTimeout {
    fn lookup(&self, _connection_key: &str) -> Duration {
        self.0
    }
}

/// A default timeout with per-key overrides.
#[derive(Debug, Clone)]
pub struct ConfiguredCommandTimeouts {
    default: Duration,
    overrides: HashMap<String, Duration>,
}

impl ConfiguredCommandTimeouts {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, key: impl Into<String>, timeout: Duration) -> Self {
        self.overrides.insert(key.into(), timeout);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, timeout: Duration) {
        self.overrides.insert(key.into(), timeout);
    }
}

impl CommandTimeoutProvider for ConfiguredCommandTimeouts {
    fn lookup(&self, connection_key: &str) -> Duration {
        self.overrides
            .get(connection_key)
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_lookup() {
        let strings = ConfiguredConnectionStrings::new().with("main", "sqlite::memory:");
        assert_eq!(strings.lookup("main").unwrap(), "sqlite::memory:");
        assert!(matches!(
            strings.lookup("other"),
            Err(DbError::ConnectionStringNotFound { .. })
        ));
    }

    #[test]
    fn test_env_variable_name() {
        let env = EnvConnectionStrings::new();
        assert_eq!(env.variable_name("orders-db"), "AMBIENT_DB_ORDERS_DB");
        assert_eq!(env.variable_name("Main"), "AMBIENT_DB_MAIN");
    }

    #[test]
    fn test_env_lookup_missing() {
        let env = EnvConnectionStrings::with_prefix("AMBIENT_DB_TEST_UNSET_");
        assert!(matches!(
            env.lookup("nothing"),
            Err(DbError::ConnectionStringNotFound { .. })
        ));
    }

    #[test]
    fn test_fixed_timeouts() {
        assert_eq!(
            FixedCommandTimeout::thirty_seconds().lookup("any"),
            Duration::from_secs(30)
        );
        assert_eq!(FixedCommandTimeout::infinite().lookup("any"), Duration::ZERO);
    }

    #[test]
    fn test_configured_timeouts_override() {
        let timeouts = ConfiguredCommandTimeouts::new(Duration::from_secs(30))
            .with_override("reports", Duration::from_secs(300));
        assert_eq!(timeouts.lookup("reports"), Duration::from_secs(300));
        assert_eq!(timeouts.lookup("main"), Duration::from_secs(30));
    }
}
