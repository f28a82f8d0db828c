//! Lifecycle and query hooks.
//!
//! Plugins are registered on [`DatabaseConfig`](crate::DatabaseConfig) and run in
//! registration order, except `on_after_query` which unwinds in reverse over the
//! plugins whose `on_before_query` ran. Together they form a nested middleware chain
//! around every statement.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::database::Database;
use crate::driver::TxId;
use crate::error::DbError;
use crate::results::ResultSet;
use crate::sql::SqlFragment;
use crate::types::TransactionBehavior;

/// Identity of an open transaction as seen by hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub id: TxId,
    pub db_name: String,
    pub behavior: TransactionBehavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// One parameterized statement.
    Statement,
    /// Parameterless multi-statement SQL.
    Batch,
}

/// A statement on its way through the pipeline.
///
/// `on_before_query` may rewrite `fragment`; the rewritten fragment is what reaches
/// the driver and what `on_after_query` sees.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub db_name: String,
    pub fragment: SqlFragment,
    pub kind: QueryKind,
    pub transaction: Option<TransactionInfo>,
}

/// Object-safe access to the concrete plugin type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
pub trait Plugin: AsAny + Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before any migration is applied. An error aborts `open()`.
    async fn on_before_migrations(&self, _db: &Database) -> Result<(), DbError> {
        Ok(())
    }

    /// Runs once the handle is connected; migrations are applied here.
    async fn on_db_init(&self, _db: &Database) -> Result<(), DbError> {
        Ok(())
    }

    /// Return `Some` to answer the query without reaching the driver.
    async fn on_before_query(
        &self,
        _db: &Database,
        _ctx: &mut QueryContext,
    ) -> Result<Option<ResultSet>, DbError> {
        Ok(None)
    }

    async fn on_after_query(
        &self,
        _db: &Database,
        _ctx: &QueryContext,
        result: ResultSet,
    ) -> Result<ResultSet, DbError> {
        Ok(result)
    }

    /// Runs after COMMIT succeeded and the session gate was released.
    async fn on_transaction_committed(&self, _db: &Database, _tx: &TransactionInfo) {}

    async fn on_transaction_rolled_back(&self, _db: &Database, _tx: &TransactionInfo) {}

    async fn on_close(&self, _db: &Database) {}
}

/// Ordered plugin list owned by a database handle.
pub(crate) struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginPipeline {
    pub(crate) fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub(crate) fn find<P: Plugin + 'static>(&self) -> Option<&P> {
        self.plugins.iter().find_map(|plugin| {
            let plugin: &dyn Plugin = plugin.as_ref();
            plugin.as_any().downcast_ref::<P>()
        })
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub(crate) async fn before_migrations(&self, db: &Database) -> Result<(), DbError> {
        for plugin in &self.plugins {
            plugin.on_before_migrations(db).await?;
        }
        Ok(())
    }

    pub(crate) async fn db_init(&self, db: &Database) -> Result<(), DbError> {
        for plugin in &self.plugins {
            plugin.on_db_init(db).await?;
        }
        Ok(())
    }

    /// Returns how many plugins were passed through, and the short-circuit result if a
    /// plugin produced one. Only the plugins before the short-circuiting one unwind.
    pub(crate) async fn before_query(
        &self,
        db: &Database,
        ctx: &mut QueryContext,
    ) -> Result<(usize, Option<ResultSet>), DbError> {
        for (idx, plugin) in self.plugins.iter().enumerate() {
            if let Some(result) = plugin.on_before_query(db, ctx).await? {
                tracing::trace!(plugin = plugin.name(), "query answered by plugin");
                return Ok((idx, Some(result)));
            }
        }
        Ok((self.plugins.len(), None))
    }

    pub(crate) async fn after_query(
        &self,
        db: &Database,
        ctx: &QueryContext,
        entered: usize,
        mut result: ResultSet,
    ) -> Result<ResultSet, DbError> {
        for plugin in self.plugins[..entered.min(self.plugins.len())].iter().rev() {
            result = plugin.on_after_query(db, ctx, result).await?;
        }
        Ok(result)
    }

    pub(crate) async fn transaction_committed(&self, db: &Database, tx: &TransactionInfo) {
        for plugin in &self.plugins {
            plugin.on_transaction_committed(db, tx).await;
        }
    }

    pub(crate) async fn transaction_rolled_back(&self, db: &Database, tx: &TransactionInfo) {
        for plugin in &self.plugins {
            plugin.on_transaction_rolled_back(db, tx).await;
        }
    }

    pub(crate) async fn close(&self, db: &Database) {
        for plugin in &self.plugins {
            plugin.on_close(db).await;
        }
    }
}
