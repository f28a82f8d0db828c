use std::sync::Arc;

use serde::Deserialize;

use super::SqliteDriver;
use crate::error::DbError;

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_foreign_keys() -> bool {
    true
}

/// Options for opening a `SQLite` database.
///
/// Deserializable so deployments can keep them next to other settings:
/// ```rust
/// use sql_reactive::sqlite::SqliteOptions;
///
/// let opts = SqliteOptions::from_json(r#"{ "path": "app.db", "journal_mode": "wal" }"#).unwrap();
/// assert_eq!(opts.busy_timeout_ms, 5000);
/// assert!(opts.foreign_keys);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SqliteOptions {
    /// File path, or `:memory:`.
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `PRAGMA journal_mode` value; left untouched when `None`.
    #[serde(default)]
    pub journal_mode: Option<String>,
    #[serde(default = "default_foreign_keys")]
    pub foreign_keys: bool,
}

impl SqliteOptions {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: None,
            foreign_keys: default_foreign_keys(),
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    /// Parse options from a JSON object.
    ///
    /// # Errors
    /// Returns [`DbError::ConfigError`] when the JSON is malformed or `path` is missing.
    pub fn from_json(json: &str) -> Result<Self, DbError> {
        serde_json::from_str(json)
            .map_err(|err| DbError::ConfigError(format!("invalid SQLite options: {err}")))
    }
}

/// Fluent builder for `SQLite` options.
#[derive(Debug, Clone)]
pub struct SqliteOptionsBuilder {
    opts: SqliteOptions,
}

impl SqliteOptionsBuilder {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            opts: SqliteOptions::new(path),
        }
    }

    #[must_use]
    pub fn busy_timeout_ms(mut self, busy_timeout_ms: u64) -> Self {
        self.opts.busy_timeout_ms = busy_timeout_ms;
        self
    }

    #[must_use]
    pub fn journal_mode(mut self, journal_mode: impl Into<String>) -> Self {
        self.opts.journal_mode = Some(journal_mode.into());
        self
    }

    #[must_use]
    pub fn foreign_keys(mut self, foreign_keys: bool) -> Self {
        self.opts.foreign_keys = foreign_keys;
        self
    }

    #[must_use]
    pub fn finish(self) -> SqliteOptions {
        self.opts
    }

    /// Finish straight into a shareable driver for `DatabaseConfig`.
    #[must_use]
    pub fn build(self) -> Arc<SqliteDriver> {
        Arc::new(SqliteDriver::new(self.finish()))
    }
}

impl SqliteDriver {
    #[must_use]
    pub fn builder(path: impl Into<String>) -> SqliteOptionsBuilder {
        SqliteOptionsBuilder::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let opts = SqliteOptionsBuilder::new("x.db")
            .busy_timeout_ms(10)
            .journal_mode("WAL")
            .foreign_keys(false)
            .finish();
        assert_eq!(opts.busy_timeout_ms, 10);
        assert_eq!(opts.journal_mode.as_deref(), Some("WAL"));
        assert!(!opts.foreign_keys);
    }

    #[test]
    fn json_requires_path() {
        let err = SqliteOptions::from_json(r#"{ "busy_timeout_ms": 1 }"#).unwrap_err();
        assert!(matches!(err, DbError::ConfigError(_)));
    }
}
