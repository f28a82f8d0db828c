use std::sync::Arc;

use async_trait::async_trait;

use super::engine::ReactiveEngine;
use crate::database::Database;
use crate::error::DbError;
use crate::plugin::{Plugin, QueryContext, TransactionInfo};
use crate::results::ResultSet;
use crate::tracker;

/// Feeds successful writes into a [`ReactiveEngine`].
#[derive(Debug, Clone, Default)]
pub struct ReactivePlugin {
    engine: Arc<ReactiveEngine>,
}

impl ReactivePlugin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<ReactiveEngine> {
        &self.engine
    }
}

#[async_trait]
impl Plugin for ReactivePlugin {
    fn name(&self) -> &'static str {
        "reactive"
    }

    async fn on_after_query(
        &self,
        db: &Database,
        ctx: &QueryContext,
        result: ResultSet,
    ) -> Result<ResultSet, DbError> {
        if !ctx.fragment.is_modify_query() {
            return Ok(result);
        }
        let deps = tracker::analyze(&ctx.fragment);
        if !deps.is_write() {
            return Ok(result);
        }
        match &ctx.transaction {
            Some(tx) => self.engine.record(tx.id, &deps.events),
            None => self.engine.on_write(db, &deps.events).await,
        }
        Ok(result)
    }

    async fn on_transaction_committed(&self, db: &Database, tx: &TransactionInfo) {
        if let Some(written) = self.engine.take_pending(tx.id) {
            self.engine.refresh(db, &written).await;
        }
    }

    async fn on_transaction_rolled_back(&self, _db: &Database, tx: &TransactionInfo) {
        if let Some(discarded) = self.engine.take_pending(tx.id) {
            tracing::trace!(tx = tx.id, tables = discarded.len(), "discarding writes of rolled back transaction");
        }
    }

    async fn on_close(&self, _db: &Database) {
        self.engine.clear();
    }
}
