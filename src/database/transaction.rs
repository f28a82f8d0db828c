use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tokio::runtime::Handle;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use super::Database;
use crate::driver::TxId;
use crate::error::{DbError, DriverError};
use crate::plugin::{QueryKind, TransactionInfo};
use crate::results::ResultSet;
use crate::sql::{Compile, SqlFragment};

tokio::task_local! {
    static ACTIVE_TX: Transaction;
}

/// The transaction the current task is running inside, if it belongs to `db` and is
/// still open. Covers both [`Database::transaction`] scopes and transactions this
/// task started with [`Database::begin`].
pub(crate) fn current_for(db: &Database) -> Option<Transaction> {
    ACTIVE_TX
        .try_with(Transaction::clone)
        .ok()
        .filter(|tx| Arc::ptr_eq(&tx.inner.db.inner, &db.inner) && !tx.is_finished())
        .or_else(|| db.inner.begun.find())
}

/// Who started an explicit transaction. Root futures driven by `block_on` have no
/// task id, so they are told apart by thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Task(tokio::task::Id),
    Thread(ThreadId),
}

impl Owner {
    fn current() -> Self {
        tokio::task::try_id().map_or_else(|| Owner::Thread(thread::current().id()), Owner::Task)
    }
}

/// The open transaction begun on this handle and the task that began it.
#[derive(Default)]
pub(super) struct BegunSlot(Mutex<Option<(Owner, Weak<TxInner>)>>);

impl BegunSlot {
    pub(super) fn record(&self, tx: &Transaction) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((Owner::current(), Arc::downgrade(&tx.inner)));
    }

    fn find(&self) -> Option<Transaction> {
        let slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let (owner, inner) = slot.as_ref()?;
        if *owner != Owner::current() {
            return None;
        }
        inner
            .upgrade()
            .map(|inner| Transaction { inner })
            .filter(|tx| !tx.is_finished())
    }
}

/// Run `fut` with `tx` as the task's current transaction.
pub(crate) async fn scope<F: Future>(tx: Transaction, fut: F) -> F::Output {
    ACTIVE_TX.scope(tx, fut).await
}

/// An open transaction holding the database's session gate.
///
/// Clones share one transaction. Finish it with [`commit`](Self::commit) or
/// [`rollback`](Self::rollback); when the last clone is dropped unfinished, a rollback
/// is spawned on the current runtime.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

struct TxInner {
    db: Database,
    info: TransactionInfo,
    gate: Mutex<Option<OwnedMutexGuard<()>>>,
    finished: AtomicBool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("db", &self.inner.info.db_name)
            .field("id", &self.inner.info.id)
            .field("behavior", &self.inner.info.behavior)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Transaction {
    pub(super) fn new(db: Database, info: TransactionInfo, gate: OwnedMutexGuard<()>) -> Self {
        Self {
            inner: Arc::new(TxInner {
                db,
                info,
                gate: Mutex::new(Some(gate)),
                finished: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> TxId {
        self.inner.info.id
    }

    #[must_use]
    pub fn info(&self) -> &TransactionInfo {
        &self.inner.info
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Run one statement inside this transaction.
    ///
    /// # Errors
    /// `TransactionFinished` after commit/rollback, `Compilation` for malformed input,
    /// or the wrapped driver failure.
    pub async fn run_query(&self, query: impl Compile) -> Result<ResultSet, DbError> {
        let fragment = query.compile()?;
        self.run_fragment(fragment, QueryKind::Statement, None).await
    }

    /// Run parameterless multi-statement SQL inside this transaction.
    ///
    /// # Errors
    /// Same as [`run_query`](Self::run_query).
    pub async fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.run_fragment(SqlFragment::verbatim(sql), QueryKind::Batch, None)
            .await
            .map(|_| ())
    }

    pub(crate) async fn run_fragment(
        &self,
        fragment: SqlFragment,
        kind: QueryKind,
        cancel: Option<&CancellationToken>,
    ) -> Result<ResultSet, DbError> {
        if self.is_finished() {
            return Err(DbError::TransactionFinished(self.id()));
        }
        self.inner
            .db
            .execute(fragment, kind, Some(&self.inner.info), cancel)
            .await
    }

    /// Commit, release the session gate, then notify plugins.
    ///
    /// A failed COMMIT leaves the engine rolled back and is reported to plugins as a
    /// rollback.
    ///
    /// # Errors
    /// `TransactionFinished` if already finished, or the wrapped driver failure.
    pub async fn commit(self) -> Result<(), DbError> {
        self.mark_finished()?;
        let db = &self.inner.db;
        let info = &self.inner.info;
        let outcome = match db.session() {
            Ok(session) => session.commit(info.id).await,
            Err(err) => Err(DriverError::closed(err.to_string())),
        };
        self.release_gate();
        match outcome {
            Ok(()) => {
                if !db.inner.suppress_log {
                    tracing::debug!(db = %info.db_name, tx = info.id, "transaction committed");
                }
                db.inner.pipeline.transaction_committed(db, info).await;
                Ok(())
            }
            Err(err) => {
                db.inner.pipeline.transaction_rolled_back(db, info).await;
                Err(db.query_error(&SqlFragment::verbatim("COMMIT"), err))
            }
        }
    }

    /// Roll back, release the session gate, then notify plugins.
    ///
    /// # Errors
    /// `TransactionFinished` if already finished, or the wrapped driver failure.
    pub async fn rollback(self) -> Result<(), DbError> {
        self.mark_finished()?;
        let db = &self.inner.db;
        let info = &self.inner.info;
        let outcome = match db.session() {
            Ok(session) => session.rollback(info.id).await,
            Err(err) => Err(DriverError::closed(err.to_string())),
        };
        self.release_gate();
        if !db.inner.suppress_log {
            tracing::debug!(db = %info.db_name, tx = info.id, "transaction rolled back");
        }
        db.inner.pipeline.transaction_rolled_back(db, info).await;
        outcome.map_err(|err| db.query_error(&SqlFragment::verbatim("ROLLBACK"), err))
    }

    fn mark_finished(&self) -> Result<(), DbError> {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            return Err(DbError::TransactionFinished(self.id()));
        }
        Ok(())
    }

    fn release_gate(&self) {
        let guard = self
            .inner
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(guard);
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let guard = self
            .gate
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let db = self.db.clone();
        let info = self.info.clone();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let outcome = match db.session() {
                        Ok(session) => session.rollback(info.id).await,
                        Err(err) => Err(DriverError::closed(err.to_string())),
                    };
                    if let Err(err) = outcome {
                        tracing::warn!(db = %info.db_name, tx = info.id, error = %err, "rollback of dropped transaction failed");
                    }
                    drop(guard);
                    db.inner.pipeline.transaction_rolled_back(&db, &info).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    db = %info.db_name,
                    tx = info.id,
                    "transaction dropped outside a tokio runtime; left to the driver"
                );
            }
        }
    }
}
