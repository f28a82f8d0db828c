//! Versioned schema migrations recorded in a ledger table.
//!
//! Each pending migration runs in its own transaction together with its ledger row,
//! ascending by id. The first failure stops the run and leaves no trace of the failing
//! migration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::database::Database;
use crate::error::{CompilationError, DbError};
use crate::plugin::Plugin;
use crate::query_builder::{Order, Select, generate_insert};
use crate::sql::SqlFragment;
use crate::types::RowValues;

pub const DEFAULT_LEDGER_TABLE: &str = "migrations";

const APPLIED_AT_FORMAT: &str = "%F %T%.f";

pub type MigrationFuture = Pin<Box<dyn Future<Output = Result<(), DbError>> + Send>>;

type UpFn = dyn Fn(Database) -> MigrationFuture + Send + Sync;

/// One schema change.
///
/// `up` receives the database handle; statements it issues through that handle join
/// the migration's transaction.
///
/// ```rust
/// use sql_reactive::prelude::*;
///
/// let create = Migration::sql(1, "create kv", "CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT)");
/// let seed = Migration::new(2, "seed kv", |db: Database| async move {
///     db.run_query(sql!("INSERT INTO kv (key, value) VALUES ({}, {})", "k", "v")).await?;
///     Ok(())
/// });
/// assert_eq!(create.id, 1);
/// assert_eq!(seed.name, "seed kv");
/// ```
#[derive(Clone)]
pub struct Migration {
    pub id: i64,
    pub name: String,
    up: Arc<UpFn>,
}

impl Migration {
    pub fn new<F, Fut>(id: i64, name: impl Into<String>, up: F) -> Self
    where
        F: Fn(Database) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DbError>> + Send + 'static,
    {
        Self {
            id,
            name: name.into(),
            up: Arc::new(move |db| Box::pin(up(db)) as MigrationFuture),
        }
    }

    /// A migration that runs a parameterless SQL batch.
    pub fn sql(id: i64, name: impl Into<String>, batch: impl Into<String>) -> Self {
        let batch: Arc<str> = Arc::from(batch.into());
        Self::new(id, name, move |db: Database| {
            let batch = Arc::clone(&batch);
            async move { db.execute_batch(&batch).await }
        })
    }

    /// Run the `up` effect.
    ///
    /// # Errors
    /// Whatever the migration body returns.
    pub async fn run_up(&self, db: Database) -> Result<(), DbError> {
        (self.up)(db).await
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub id: i64,
    pub name: String,
    pub applied_at: String,
}

#[derive(Debug, Clone)]
pub struct MigrationRunner {
    migrations: Vec<Migration>,
    table: String,
}

impl MigrationRunner {
    #[must_use]
    pub fn new(migrations: Vec<Migration>) -> Self {
        Self {
            migrations,
            table: DEFAULT_LEDGER_TABLE.to_owned(),
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Reject duplicate ids.
    ///
    /// # Errors
    /// `DuplicateMigration` naming both migrations that share an id.
    pub fn validate(&self) -> Result<(), DbError> {
        let mut seen: HashMap<i64, &str> = HashMap::with_capacity(self.migrations.len());
        for migration in &self.migrations {
            if let Some(first) = seen.insert(migration.id, &migration.name) {
                return Err(DbError::DuplicateMigration {
                    id: migration.id,
                    first: first.to_owned(),
                    second: migration.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Create the ledger table if it does not exist.
    ///
    /// # Errors
    /// The wrapped driver failure.
    pub async fn ensure_ledger(&self, db: &Database) -> Result<(), DbError> {
        db.run_query(crate::sql!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, name TEXT NOT NULL, appliedAt TEXT NOT NULL)",
            SqlFragment::ident(&self.table)
        ))
        .await
        .map(|_| ())
    }

    /// Ledger rows ordered by id.
    ///
    /// # Errors
    /// The wrapped driver failure, or `ExecutionError` for a malformed ledger row.
    pub async fn applied(&self, db: &Database) -> Result<Vec<AppliedMigration>, DbError> {
        let rows = db
            .run_query(
                Select::from(&self.table)
                    .columns(["id", "name", "appliedAt"])
                    .order_by("id", Order::Asc),
            )
            .await?;
        rows.results
            .iter()
            .map(|row| {
                let id = row.get("id").and_then(RowValues::as_int);
                let name = row.get("name").and_then(RowValues::as_text);
                let applied_at = row.get("appliedAt").and_then(RowValues::as_text);
                match (id, name, applied_at) {
                    (Some(id), Some(name), Some(applied_at)) => Ok(AppliedMigration {
                        id,
                        name: name.to_owned(),
                        applied_at: applied_at.to_owned(),
                    }),
                    _ => Err(DbError::ExecutionError(format!(
                        "malformed row in migration ledger {}",
                        self.table
                    ))),
                }
            })
            .collect()
    }

    /// Migrations not yet in the ledger, ascending by id.
    ///
    /// # Errors
    /// Same as [`applied`](Self::applied).
    pub async fn pending(&self, db: &Database) -> Result<Vec<&Migration>, DbError> {
        let applied: BTreeSet<i64> = self.applied(db).await?.into_iter().map(|m| m.id).collect();
        Ok(self.missing_from(&applied))
    }

    /// Apply every missing migration and return the ids applied.
    ///
    /// # Errors
    /// `MigrationFailed` for the first migration whose transaction failed; earlier
    /// migrations stay applied.
    pub async fn apply(&self, db: &Database) -> Result<Vec<i64>, DbError> {
        self.ensure_ledger(db).await?;
        let applied: BTreeSet<i64> = self.applied(db).await?.into_iter().map(|m| m.id).collect();
        let highest = applied.last().copied();

        let mut done = Vec::new();
        for migration in self.missing_from(&applied) {
            if highest.is_some_and(|highest| migration.id < highest) {
                tracing::warn!(
                    db = %db.name(),
                    id = migration.id,
                    name = %migration.name,
                    highest_applied = highest,
                    "backfilling migration below the highest applied id"
                );
            }

            let outcome = db
                .transaction(|tx| async move {
                    migration.run_up(tx.database().clone()).await?;
                    tx.run_query(self.ledger_insert(migration)?).await?;
                    Ok(())
                })
                .await;
            if let Err(source) = outcome {
                tracing::error!(db = %db.name(), id = migration.id, name = %migration.name, error = %source, "migration failed");
                return Err(DbError::MigrationFailed {
                    id: migration.id,
                    name: migration.name.clone(),
                    source: Box::new(source),
                });
            }

            tracing::info!(db = %db.name(), id = migration.id, name = %migration.name, "migration applied");
            done.push(migration.id);
        }
        Ok(done)
    }

    fn missing_from(&self, applied: &BTreeSet<i64>) -> Vec<&Migration> {
        let mut missing: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|migration| !applied.contains(&migration.id))
            .collect();
        missing.sort_by_key(|migration| migration.id);
        missing
    }

    fn ledger_insert(&self, migration: &Migration) -> Result<SqlFragment, CompilationError> {
        let applied_at = Utc::now().naive_utc().format(APPLIED_AT_FORMAT).to_string();
        let row = BTreeMap::from([
            ("id".to_owned(), RowValues::Int(migration.id)),
            ("name".to_owned(), RowValues::Text(migration.name.clone())),
            ("appliedAt".to_owned(), RowValues::Text(applied_at)),
        ]);
        generate_insert(&self.table, &[row], false)
    }
}

/// Built-in plugin that drives a [`MigrationRunner`] through the init hooks. Always
/// registered first.
#[derive(Debug)]
pub struct MigrationsPlugin {
    runner: MigrationRunner,
}

impl MigrationsPlugin {
    #[must_use]
    pub fn new(runner: MigrationRunner) -> Self {
        Self { runner }
    }

    #[must_use]
    pub fn runner(&self) -> &MigrationRunner {
        &self.runner
    }
}

#[async_trait]
impl Plugin for MigrationsPlugin {
    fn name(&self) -> &'static str {
        "migrations"
    }

    async fn on_before_migrations(&self, _db: &Database) -> Result<(), DbError> {
        self.runner.validate()
    }

    async fn on_db_init(&self, db: &Database) -> Result<(), DbError> {
        let applied = self.runner.apply(db).await?;
        if !applied.is_empty() {
            tracing::info!(db = %db.name(), count = applied.len(), "migrations complete");
        }
        Ok(())
    }
}
