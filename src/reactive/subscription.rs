use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::engine::ReactiveEngine;
use super::ListenerId;
use crate::database::Database;
use crate::error::DbError;
use crate::results::ResultSet;
use crate::sql::{Compile, SqlFragment};
use crate::tracker::TableRef;

/// Handle to a live query. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    db: Database,
    engine: Arc<ReactiveEngine>,
}

impl Subscription {
    pub(super) fn new(id: u64, db: Database, engine: Arc<ReactiveEngine>) -> Self {
        Self { id, db, engine }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.engine.contains(self.id)
    }

    /// The last successful result; `None` once unsubscribed.
    #[must_use]
    pub fn current(&self) -> Option<ResultSet> {
        self.engine.current(self.id)
    }

    #[must_use]
    pub fn fragment(&self) -> Option<SqlFragment> {
        self.engine.fragment(self.id)
    }

    /// Tables this query depends on.
    #[must_use]
    pub fn tables(&self) -> BTreeSet<TableRef> {
        self.engine.tables(self.id)
    }

    /// `None` if the subscription is gone.
    pub fn add_listener<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: Fn(&ResultSet) + Send + Sync + 'static,
    {
        self.engine.add_listener(self.id, Arc::new(listener))
    }

    pub fn remove_listener(&self, listener_id: ListenerId) -> bool {
        self.engine.remove_listener(self.id, listener_id)
    }

    /// Point the subscription at a new query (typically new parameters) and run it.
    ///
    /// # Errors
    /// `Compilation`, the query's own failure (the old query stays bound), or
    /// `ExecutionError` once unsubscribed.
    pub async fn rebind(&self, query: impl Compile) -> Result<(), DbError> {
        let fragment = query.compile()?;
        self.engine.rebind(&self.db, self.id, fragment).await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.engine.unregister(self.id) {
            tracing::debug!(db = %self.db.name(), subscription = self.id, "live query unsubscribed");
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("db", &self.db.name())
            .field("active", &self.is_active())
            .finish()
    }
}
