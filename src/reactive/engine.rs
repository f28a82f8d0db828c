use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::subscription::Subscription;
use super::{ChangeListener, ErrorListener, ListenerId};
use crate::database::Database;
use crate::driver::TxId;
use crate::error::DbError;
use crate::results::ResultSet;
use crate::sql::SqlFragment;
use crate::tracker::{self, TableRef, WriteEvent};

struct LiveQuery {
    fragment: SqlFragment,
    tables: BTreeSet<TableRef>,
    last_result: ResultSet,
    listeners: Vec<(ListenerId, ChangeListener)>,
}

/// A subscription whose initial query is still running.
struct Initializing {
    tables: BTreeSet<TableRef>,
    stale: bool,
}

/// Registry of live queries for one database handle.
///
/// Writes outside a transaction refresh affected subscriptions right after the
/// statement; writes inside one are collected per transaction and refreshed once on
/// commit, or dropped on rollback.
pub struct ReactiveEngine {
    subscriptions: Mutex<BTreeMap<u64, LiveQuery>>,
    initializing: Mutex<HashMap<u64, Initializing>>,
    pending: Mutex<HashMap<TxId, BTreeSet<TableRef>>>,
    error_listeners: Mutex<Vec<(ListenerId, ErrorListener)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for ReactiveEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveEngine")
            .field("subscriptions", &self.subscription_count())
            .field("pending_transactions", &lock(&self.pending).len())
            .finish_non_exhaustive()
    }
}

impl Default for ReactiveEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReactiveEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(BTreeMap::new()),
            initializing: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            error_listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `fragment` once and register it. The initial result is stored, not
    /// emitted.
    ///
    /// Writes to the query's tables that land while the initial query is in flight
    /// mark it stale; the subscription then refreshes once right after registering,
    /// and listeners see that refresh as a change.
    pub(crate) async fn subscribe(
        self: &Arc<Self>,
        db: &Database,
        fragment: SqlFragment,
        listener: ChangeListener,
    ) -> Result<Subscription, DbError> {
        let tables = tracker::analyze(&fragment).tables();
        let id = self.next_id();
        lock(&self.initializing).insert(
            id,
            Initializing {
                tables: tables.clone(),
                stale: false,
            },
        );

        let initial = match db.run_query(&fragment).await {
            Ok(initial) => initial,
            Err(err) => {
                lock(&self.initializing).remove(&id);
                return Err(err);
            }
        };

        let listener_id = self.next_id();
        tracing::debug!(db = %db.name(), subscription = id, tables = ?tables, "live query registered");
        let stale = {
            // Held across the insert so a concurrent refresh sees either the marker
            // or the registered subscription.
            let mut initializing = lock(&self.initializing);
            let stale = initializing.remove(&id).is_some_and(|marker| marker.stale);
            lock(&self.subscriptions).insert(
                id,
                LiveQuery {
                    fragment: fragment.clone(),
                    tables,
                    last_result: initial,
                    listeners: vec![(listener_id, listener)],
                },
            );
            stale
        };

        if stale {
            tracing::debug!(db = %db.name(), subscription = id, "write landed during initial query, refreshing");
            self.refresh_one(db, id, fragment).await;
        }
        Ok(Subscription::new(id, db.clone(), Arc::clone(self)))
    }

    pub(crate) fn unregister(&self, id: u64) -> bool {
        lock(&self.subscriptions).remove(&id).is_some()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        lock(&self.subscriptions).contains_key(&id)
    }

    pub(crate) fn current(&self, id: u64) -> Option<ResultSet> {
        lock(&self.subscriptions)
            .get(&id)
            .map(|live| live.last_result.clone())
    }

    pub(crate) fn fragment(&self, id: u64) -> Option<SqlFragment> {
        lock(&self.subscriptions)
            .get(&id)
            .map(|live| live.fragment.clone())
    }

    pub(crate) fn tables(&self, id: u64) -> BTreeSet<TableRef> {
        lock(&self.subscriptions)
            .get(&id)
            .map(|live| live.tables.clone())
            .unwrap_or_default()
    }

    pub(crate) fn add_listener(&self, id: u64, listener: ChangeListener) -> Option<ListenerId> {
        let mut subscriptions = lock(&self.subscriptions);
        let live = subscriptions.get_mut(&id)?;
        let listener_id = self.next_id();
        live.listeners.push((listener_id, listener));
        Some(listener_id)
    }

    pub(crate) fn remove_listener(&self, id: u64, listener_id: ListenerId) -> bool {
        let mut subscriptions = lock(&self.subscriptions);
        let Some(live) = subscriptions.get_mut(&id) else {
            return false;
        };
        let before = live.listeners.len();
        live.listeners.retain(|(existing, _)| *existing != listener_id);
        live.listeners.len() != before
    }

    /// Swap a subscription's query. Tables are recomputed only when the SQL text
    /// changes; listeners fire if the new result differs.
    pub(crate) async fn rebind(
        &self,
        db: &Database,
        id: u64,
        fragment: SqlFragment,
    ) -> Result<(), DbError> {
        if !self.contains(id) {
            return Err(not_subscribed(id));
        }
        let result = db.run_query(&fragment).await?;
        let listeners = {
            let mut subscriptions = lock(&self.subscriptions);
            let live = subscriptions.get_mut(&id).ok_or_else(|| not_subscribed(id))?;
            if live.fragment.text() != fragment.text() {
                live.tables = tracker::analyze(&fragment).tables();
            }
            live.fragment = fragment;
            if live.last_result == result {
                Vec::new()
            } else {
                live.last_result = result.clone();
                live.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
            }
        };
        for listener in listeners {
            listener(&result);
        }
        Ok(())
    }

    pub fn add_error_listener(&self, listener: ErrorListener) -> ListenerId {
        let listener_id = self.next_id();
        lock(&self.error_listeners).push((listener_id, listener));
        listener_id
    }

    pub fn remove_error_listener(&self, listener_id: ListenerId) -> bool {
        let mut listeners = lock(&self.error_listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != listener_id);
        listeners.len() != before
    }

    /// Remember writes made inside transaction `tx` until it finishes.
    pub(crate) fn record(&self, tx: TxId, events: &[WriteEvent]) {
        lock(&self.pending)
            .entry(tx)
            .or_default()
            .extend(events.iter().map(|event| event.table.clone()));
    }

    pub(crate) fn take_pending(&self, tx: TxId) -> Option<BTreeSet<TableRef>> {
        lock(&self.pending).remove(&tx)
    }

    /// Refresh every subscription affected by `events` now.
    pub async fn on_write(&self, db: &Database, events: &[WriteEvent]) {
        let written: BTreeSet<TableRef> = events.iter().map(|event| event.table.clone()).collect();
        self.refresh(db, &written).await;
    }

    /// Re-run each affected subscription once, in subscription order.
    pub(crate) async fn refresh(&self, db: &Database, written: &BTreeSet<TableRef>) {
        for marker in lock(&self.initializing).values_mut() {
            if tracker::affected_by(&marker.tables, written) {
                marker.stale = true;
            }
        }

        let affected: Vec<(u64, SqlFragment)> = lock(&self.subscriptions)
            .iter()
            .filter(|(_, live)| tracker::affected_by(&live.tables, written))
            .map(|(id, live)| (*id, live.fragment.clone()))
            .collect();
        if affected.is_empty() {
            return;
        }
        tracing::debug!(db = %db.name(), written = ?written, count = affected.len(), "refreshing live queries");

        for (id, fragment) in affected {
            self.refresh_one(db, id, fragment).await;
        }
    }

    async fn refresh_one(&self, db: &Database, id: u64, fragment: SqlFragment) {
        match db.run_query(&fragment).await {
            Ok(result) => self.publish(id, &fragment, result),
            Err(source) => self.report(id, &fragment, source),
        }
    }

    fn publish(&self, id: u64, fragment: &SqlFragment, result: ResultSet) {
        let listeners: Vec<ChangeListener> = {
            let mut subscriptions = lock(&self.subscriptions);
            // Unsubscribed or rebound while the query ran.
            let Some(live) = subscriptions.get_mut(&id) else {
                return;
            };
            if live.fragment != *fragment || live.last_result == result {
                return;
            }
            live.last_result = result.clone();
            live.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(&result);
        }
    }

    fn report(&self, id: u64, fragment: &SqlFragment, source: DbError) {
        let err = DbError::ReactiveReexecution {
            subscription: id,
            sql: fragment.text(),
            source: Box::new(source),
        };
        tracing::error!(subscription = id, error = %err, cause = ?std::error::Error::source(&err), "live query refresh failed");
        let listeners: Vec<ErrorListener> = lock(&self.error_listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&err);
        }
    }

    /// Drop every subscription and pending write set.
    pub(crate) fn clear(&self) {
        lock(&self.subscriptions).clear();
        lock(&self.initializing).clear();
        lock(&self.pending).clear();
    }
}

fn not_subscribed(id: u64) -> DbError {
    DbError::ExecutionError(format!("live query {id} is no longer subscribed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::WriteKind;

    #[test]
    fn pending_writes_coalesce_per_transaction() {
        let engine = ReactiveEngine::new();
        let insert = WriteEvent {
            table: TableRef::named("kv"),
            kind: WriteKind::Insert,
        };
        let update = WriteEvent {
            table: TableRef::named("KV"),
            kind: WriteKind::Update,
        };
        engine.record(1, &[insert.clone()]);
        engine.record(1, &[update]);
        engine.record(2, &[insert]);

        let first = engine.take_pending(1).expect("tx 1 recorded");
        assert_eq!(first.len(), 1);
        assert!(engine.take_pending(1).is_none());
        assert!(engine.take_pending(2).is_some());
    }

    #[test]
    fn error_listeners_can_be_removed() {
        let engine = ReactiveEngine::new();
        let id = engine.add_error_listener(Arc::new(|_err: &DbError| {}));
        assert!(engine.remove_error_listener(id));
        assert!(!engine.remove_error_listener(id));
    }
}
