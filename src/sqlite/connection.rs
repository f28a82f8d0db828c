use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::driver::{Driver, DriverConfig, DriverHandle, TxId};
use crate::error::DriverError;
use crate::results::ResultSet;
use crate::types::{QueryAndParams, TransactionBehavior};

use super::config::SqliteOptions;
use super::params::Params;
use super::worker::SqliteWorker;

/// Native `SQLite` backend.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sql_reactive::prelude::*;
///
/// # async fn demo() -> Result<(), DbError> {
/// let db = Database::open(DatabaseConfig::new(
///     "notes",
///     Arc::new(SqliteDriver::new(SqliteOptions::new("notes.db"))),
/// ))
/// .await?;
/// # let _ = db;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    options: SqliteOptions,
}

impl SqliteDriver {
    #[must_use]
    pub fn new(options: SqliteOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(SqliteOptions::in_memory())
    }

    #[must_use]
    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn open(&self, config: &DriverConfig) -> Result<Box<dyn DriverHandle>, DriverError> {
        let worker = SqliteWorker::spawn(&config.db_name, self.options.clone()).await?;
        tracing::debug!(db = %config.db_name, path = %self.options.path, "sqlite connection opened");
        Ok(Box::new(SqliteConnection {
            worker,
            path: self.options.path.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One `SQLite` session backed by a dedicated worker thread.
pub struct SqliteConnection {
    worker: SqliteWorker,
    path: String,
    closed: AtomicBool,
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl SqliteConnection {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::closed(format!(
                "SQLite connection to {} is closed",
                self.path
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DriverHandle for SqliteConnection {
    async fn run(&self, query: &QueryAndParams, tx: Option<TxId>) -> Result<ResultSet, DriverError> {
        self.ensure_open()?;
        let params = Params::convert(&query.params).into_values();
        self.worker.run(tx, query.query.clone(), params).await
    }

    async fn execute_batch(&self, sql: &str, tx: Option<TxId>) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.worker.execute_batch(tx, sql.to_owned()).await
    }

    async fn begin(&self, behavior: TransactionBehavior) -> Result<TxId, DriverError> {
        self.ensure_open()?;
        self.worker.begin(behavior).await
    }

    async fn commit(&self, tx: TxId) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.worker.commit(tx).await
    }

    async fn rollback(&self, tx: TxId) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.worker.rollback(tx).await
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.worker.shutdown().await
    }
}
