//! Live queries that re-run when the tables they read are written.
//!
//! Register [`ReactivePlugin`] on the database, then subscribe through
//! [`ReactiveQueries`]:
//!
//! ```rust,no_run
//! use sql_reactive::prelude::*;
//!
//! # async fn demo() -> Result<(), DbError> {
//! let db = Database::open(
//!     DatabaseConfig::new("app", SqliteDriver::builder(":memory:").build())
//!         .migration(Migration::sql(1, "kv", "CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT)"))
//!         .plugin(ReactivePlugin::new()),
//! )
//! .await?;
//!
//! let live = db
//!     .subscribe(Select::from("kv"), |rows: &ResultSet| println!("{} rows", rows.len()))
//!     .await?;
//! db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b")).await?;
//! assert_eq!(live.current().map(|rows| rows.len()), Some(1));
//! # Ok(())
//! # }
//! ```

mod engine;
mod plugin;
mod subscription;

use std::sync::Arc;

use async_trait::async_trait;

pub use engine::ReactiveEngine;
pub use plugin::ReactivePlugin;
pub use subscription::Subscription;

use crate::database::Database;
use crate::error::DbError;
use crate::results::ResultSet;
use crate::sql::Compile;

pub type ListenerId = u64;
pub type ChangeListener = Arc<dyn Fn(&ResultSet) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&DbError) + Send + Sync>;

/// Live-query entry points on [`Database`].
#[async_trait]
pub trait ReactiveQueries {
    /// Run `query` once and keep it live. `on_change` fires on later changes only.
    ///
    /// # Errors
    /// `PluginMissing` without a [`ReactivePlugin`], or the initial query's failure.
    async fn subscribe<Q, F>(&self, query: Q, on_change: F) -> Result<Subscription, DbError>
    where
        Q: Compile + Send,
        F: Fn(&ResultSet) + Send + Sync + 'static;

    /// Receive live-query refresh failures.
    ///
    /// # Errors
    /// `PluginMissing` without a [`ReactivePlugin`].
    fn on_reactive_error<F>(&self, listener: F) -> Result<ListenerId, DbError>
    where
        F: Fn(&DbError) + Send + Sync + 'static;

    /// # Errors
    /// `PluginMissing` without a [`ReactivePlugin`].
    fn reactive_engine(&self) -> Result<Arc<ReactiveEngine>, DbError>;
}

#[async_trait]
impl ReactiveQueries for Database {
    async fn subscribe<Q, F>(&self, query: Q, on_change: F) -> Result<Subscription, DbError>
    where
        Q: Compile + Send,
        F: Fn(&ResultSet) + Send + Sync + 'static,
    {
        let fragment = query.compile()?;
        let engine = self.reactive_engine()?;
        engine.subscribe(self, fragment, Arc::new(on_change)).await
    }

    fn on_reactive_error<F>(&self, listener: F) -> Result<ListenerId, DbError>
    where
        F: Fn(&DbError) + Send + Sync + 'static,
    {
        Ok(self.reactive_engine()?.add_error_listener(Arc::new(listener)))
    }

    fn reactive_engine(&self) -> Result<Arc<ReactiveEngine>, DbError> {
        self.plugin::<ReactivePlugin>()
            .map(|plugin| Arc::clone(plugin.engine()))
            .ok_or(DbError::PluginMissing("reactive"))
    }
}
