//! The storage boundary every backend adapter implements.
//!
//! The core only ever talks to a backend through [`Driver`] (open) and
//! [`DriverHandle`] (statements and transactions on one open session). Adapters map
//! their engine failures into [`DriverError`].

use async_trait::async_trait;

use crate::error::DriverError;
use crate::results::ResultSet;
use crate::types::{QueryAndParams, TransactionBehavior};

/// Adapter-scoped identifier of an open transaction.
pub type TxId = u64;

/// What the core tells a driver when opening a session.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Logical database name, used by adapters for thread names and log fields.
    pub db_name: String,
}

impl DriverConfig {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
        }
    }
}

/// Backend factory.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short backend label for logs (`"sqlite"`).
    fn kind(&self) -> &'static str;

    /// Open one session.
    ///
    /// # Errors
    /// Returns [`DriverError`] when the engine cannot be opened or configured.
    async fn open(&self, config: &DriverConfig) -> Result<Box<dyn DriverHandle>, DriverError>;
}

/// One open backend session, owned by exactly one `Database`.
///
/// Statements passed with `Some(tx)` run inside that transaction; `None` means
/// autocommit.
#[async_trait]
pub trait DriverHandle: Send + Sync {
    /// Run one statement. Reads return rows, writes return `rows_affected`.
    async fn run(&self, query: &QueryAndParams, tx: Option<TxId>) -> Result<ResultSet, DriverError>;

    /// Run parameterless, possibly multi-statement SQL.
    async fn execute_batch(&self, sql: &str, tx: Option<TxId>) -> Result<(), DriverError>;

    async fn begin(&self, behavior: TransactionBehavior) -> Result<TxId, DriverError>;

    async fn commit(&self, tx: TxId) -> Result<(), DriverError>;

    async fn rollback(&self, tx: TxId) -> Result<(), DriverError>;

    /// Release the session. Later calls fail with a `Closed` error.
    async fn close(&self) -> Result<(), DriverError>;
}
