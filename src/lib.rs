//! Async SQL runtime with pluggable backends, versioned migrations, a composable
//! query builder, and live queries that re-run when the tables they read change.
//!
//! ```rust,no_run
//! use sql_reactive::prelude::*;
//!
//! # async fn demo() -> Result<(), DbError> {
//! let db = open_database(
//!     DatabaseConfig::new("notes", SqliteDriver::builder("notes.db").build())
//!         .migration(Migration::sql(
//!             1,
//!             "create notes",
//!             "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)",
//!         ))
//!         .plugin(ReactivePlugin::new()),
//! )
//! .await?;
//!
//! let notes = db.subscribe(Select::from("notes").order_by("id", Order::Desc), |rows: &ResultSet| {
//!     println!("{} notes", rows.len());
//! })
//! .await?;
//!
//! db.run_query(Insert::into("notes").columns(["body"]).values(["hello"])).await?;
//! # drop(notes);
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod driver;
pub mod error;
pub mod migrations;
pub mod plugin;
pub mod prelude;
pub mod query;
pub mod query_builder;
pub mod reactive;
pub mod results;
pub mod sql;
pub mod tracker;
pub mod types;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use database::{Database, DatabaseConfig, HandleState, Transaction, open_database};
pub use driver::{Driver, DriverConfig, DriverHandle, TxId};
pub use error::{CompilationError, DbError, DriverError, DriverErrorKind};
pub use migrations::{AppliedMigration, Migration, MigrationRunner, MigrationsPlugin};
pub use plugin::{Plugin, QueryContext, QueryKind, TransactionInfo};
pub use reactive::{ReactiveEngine, ReactivePlugin, ReactiveQueries, Subscription};
pub use results::{CustomDbRow, ResultSet};
pub use sql::{Compile, SqlFragment};
pub use types::{QueryAndParams, RowValues, TransactionBehavior};
