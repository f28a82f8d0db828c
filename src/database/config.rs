use std::fmt;
use std::sync::Arc;

use crate::driver::Driver;
use crate::migrations::{DEFAULT_LEDGER_TABLE, Migration};
use crate::plugin::Plugin;

/// Everything needed to open a [`Database`](super::Database).
///
/// ```rust
/// use sql_reactive::prelude::*;
///
/// let config = DatabaseConfig::new("app", SqliteDriver::builder(":memory:").build())
///     .migration(Migration::sql(1, "create notes", "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)"))
///     .plugin(ReactivePlugin::new())
///     .suppress_log(true);
/// assert_eq!(config.migrations.len(), 1);
/// assert_eq!(config.migrations_table, "migrations");
/// ```
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Identifier used in logs and error context.
    pub name: String,
    pub backend: Arc<dyn Driver>,
    pub migrations: Vec<Migration>,
    /// Registered after the built-in migrations plugin, in this order.
    pub plugins: Vec<Arc<dyn Plugin>>,
    /// Skip the per-statement `debug!` event.
    pub suppress_log: bool,
    pub migrations_table: String,
}

impl DatabaseConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, backend: Arc<dyn Driver>) -> Self {
        Self {
            name: name.into(),
            backend,
            migrations: Vec::new(),
            plugins: Vec::new(),
            suppress_log: false,
            migrations_table: DEFAULT_LEDGER_TABLE.to_owned(),
        }
    }

    #[must_use]
    pub fn migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    #[must_use]
    pub fn migrations(mut self, migrations: impl IntoIterator<Item = Migration>) -> Self {
        self.migrations.extend(migrations);
        self
    }

    #[must_use]
    pub fn plugin(self, plugin: impl Plugin + 'static) -> Self {
        self.shared_plugin(Arc::new(plugin))
    }

    /// Register a plugin the caller keeps a handle to.
    #[must_use]
    pub fn shared_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    #[must_use]
    pub fn suppress_log(mut self, suppress_log: bool) -> Self {
        self.suppress_log = suppress_log;
        self
    }

    #[must_use]
    pub fn migrations_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("backend", &self.backend.kind())
            .field("migrations", &self.migrations.len())
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("suppress_log", &self.suppress_log)
            .field("migrations_table", &self.migrations_table)
            .finish()
    }
}
