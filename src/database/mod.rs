//! The database handle: lifecycle, the session gate, and the query path.

mod config;
mod state;
mod transaction;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

pub use config::DatabaseConfig;
pub use state::HandleState;
pub use transaction::Transaction;

use crate::driver::{Driver, DriverConfig, DriverHandle};
use crate::error::{DbError, DriverError};
use crate::migrations::{MigrationRunner, MigrationsPlugin};
use crate::plugin::{Plugin, PluginPipeline, QueryContext, QueryKind, TransactionInfo};
use crate::query::QueryBuilder;
use crate::results::ResultSet;
use crate::sql::{Compile, SqlFragment};
use crate::types::TransactionBehavior;

/// A connected database: one driver session, its plugins, and its lifecycle state.
///
/// Cheap to clone; clones share the session. Every statement passes through the
/// plugin pipeline and a FIFO session gate, so statements on one handle run one at a
/// time in submission order while other handles proceed independently.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

struct DbInner {
    name: String,
    backend: &'static str,
    driver: Arc<dyn Driver>,
    handle: OnceLock<Box<dyn DriverHandle>>,
    gate: Arc<AsyncMutex<()>>,
    begun: transaction::BegunSlot,
    pipeline: PluginPipeline,
    state: Mutex<HandleState>,
    suppress_log: bool,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("backend", &self.inner.backend)
            .field("state", &self.state())
            .field("plugins", &self.inner.pipeline.names())
            .finish()
    }
}

impl Database {
    /// Connect and run the init phases (migrations, then plugin setup).
    ///
    /// # Errors
    /// Driver open failures, `DuplicateMigration`, `MigrationFailed`, or whatever a
    /// plugin's init hook returns. The driver session is closed on failure.
    pub async fn open(config: DatabaseConfig) -> Result<Self, DbError> {
        let db = Self::connect(config).await?;
        if let Err(err) = db.initialize().await {
            if let Ok(session) = db.session() {
                if let Err(close_err) = session.close().await {
                    tracing::warn!(db = %db.inner.name, error = %close_err, "failed to close driver after init failure");
                }
            }
            return Err(err);
        }
        Ok(db)
    }

    /// Open the driver session without running the init phases. The handle ends in
    /// [`HandleState::MigrationsPending`]; call [`initialize`](Self::initialize) next.
    ///
    /// # Errors
    /// `ConfigError` for an empty name, or the driver's open failure.
    pub async fn connect(config: DatabaseConfig) -> Result<Self, DbError> {
        let db = Self::new(config)?;
        db.open_session().await?;
        Ok(db)
    }

    /// Build a handle in [`HandleState::Unopened`]. Nothing touches the driver until
    /// [`open_session`](Self::open_session).
    ///
    /// # Errors
    /// `ConfigError` for an empty name.
    pub fn new(config: DatabaseConfig) -> Result<Self, DbError> {
        let DatabaseConfig {
            name,
            backend,
            migrations,
            plugins,
            suppress_log,
            migrations_table,
        } = config;
        if name.trim().is_empty() {
            return Err(DbError::ConfigError("database name must not be empty".into()));
        }

        let runner = MigrationRunner::new(migrations).with_table(migrations_table);
        let mut pipeline: Vec<Arc<dyn Plugin>> = Vec::with_capacity(plugins.len() + 1);
        pipeline.push(Arc::new(MigrationsPlugin::new(runner)));
        pipeline.extend(plugins);

        Ok(Self {
            inner: Arc::new(DbInner {
                name,
                backend: backend.kind(),
                driver: backend,
                handle: OnceLock::new(),
                gate: Arc::new(AsyncMutex::new(())),
                begun: transaction::BegunSlot::default(),
                pipeline: PluginPipeline::new(pipeline),
                state: Mutex::new(HandleState::Unopened),
                suppress_log,
            }),
        })
    }

    /// Open the driver session: `Unopened` to `MigrationsPending`, or `Failed` when
    /// the driver refuses.
    ///
    /// # Errors
    /// `InvalidState` unless the handle is unopened, or the driver's open failure.
    pub async fn open_session(&self) -> Result<(), DbError> {
        let state = self.state();
        if state != HandleState::Unopened {
            return Err(self.invalid_state(state));
        }
        let session = match self.inner.driver.open(&DriverConfig::new(&self.inner.name)).await {
            Ok(session) => session,
            Err(err) => {
                self.set_state(HandleState::Failed);
                tracing::error!(db = %self.inner.name, error = %err, "driver failed to open");
                return Err(err.into());
            }
        };
        if let Err(extra) = self.inner.handle.set(session) {
            // Lost a race with a concurrent open.
            if let Err(err) = extra.close().await {
                tracing::warn!(db = %self.inner.name, error = %err, "failed to close duplicate session");
            }
            return Err(self.invalid_state(self.state()));
        }
        self.set_state(HandleState::MigrationsPending);
        tracing::info!(db = %self.inner.name, backend = self.inner.backend, "database connected");
        Ok(())
    }

    /// Run `on_before_migrations` then `on_db_init` for every plugin. Success moves
    /// the handle to `Ready`, any error to `Failed`.
    ///
    /// # Errors
    /// `InvalidState` unless the handle is pending migrations, otherwise the first
    /// hook failure.
    pub async fn initialize(&self) -> Result<(), DbError> {
        let state = self.state();
        if state != HandleState::MigrationsPending {
            return Err(self.invalid_state(state));
        }

        let outcome = async {
            self.inner.pipeline.before_migrations(self).await?;
            self.set_state(HandleState::MigrationsApplying);
            self.inner.pipeline.db_init(self).await
        }
        .await;

        match outcome {
            Ok(()) => {
                self.set_state(HandleState::Ready);
                tracing::info!(db = %self.inner.name, "database ready");
                Ok(())
            }
            Err(err) => {
                self.set_state(HandleState::Failed);
                tracing::error!(db = %self.inner.name, error = %err, "database initialization failed");
                Err(err)
            }
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The driver kind, e.g. `"sqlite"`.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.inner.backend
    }

    #[must_use]
    pub fn state(&self) -> HandleState {
        *self.lock_state()
    }

    /// Look up a registered plugin by type.
    #[must_use]
    pub fn plugin<P: Plugin + 'static>(&self) -> Option<&P> {
        self.inner.pipeline.find::<P>()
    }

    /// Compile and run one statement.
    ///
    /// On a task running inside [`transaction`](Self::transaction) for this handle, or
    /// holding a transaction it started with [`begin`](Self::begin), the statement
    /// joins that transaction.
    ///
    /// # Errors
    /// `Compilation`, `InvalidState`, a plugin hook failure, or `Query` wrapping the
    /// driver failure.
    ///
    /// ```rust,no_run
    /// use sql_reactive::prelude::*;
    ///
    /// # async fn demo(db: Database) -> Result<(), DbError> {
    /// let rows = db.run_query(sql!("SELECT id FROM notes WHERE body = {}", "hi")).await?;
    /// # let _ = rows;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_query(&self, query: impl Compile) -> Result<ResultSet, DbError> {
        let fragment = query.compile()?;
        self.run_fragment(fragment, QueryKind::Statement, None).await
    }

    /// Run statements one after another, stopping at the first failure. Not atomic;
    /// see [`run_in_atomic_transaction`](Self::run_in_atomic_transaction).
    ///
    /// # Errors
    /// The first failing statement's error.
    pub async fn run_queries<I>(&self, queries: I) -> Result<Vec<ResultSet>, DbError>
    where
        I: IntoIterator,
        I::Item: Compile,
    {
        let mut results = Vec::new();
        for query in queries {
            results.push(self.run_query(query).await?);
        }
        Ok(results)
    }

    /// Run statements inside one transaction; all or nothing.
    ///
    /// # Errors
    /// The first failing statement's error, after rollback.
    pub async fn run_in_atomic_transaction<I>(&self, queries: I) -> Result<Vec<ResultSet>, DbError>
    where
        I: IntoIterator,
        I::Item: Compile,
    {
        let fragments = queries
            .into_iter()
            .map(|query| query.compile())
            .collect::<Result<Vec<_>, _>>()?;
        self.transaction(|tx| async move {
            let mut results = Vec::with_capacity(fragments.len());
            for fragment in fragments {
                results.push(tx.run_query(fragment).await?);
            }
            Ok(results)
        })
        .await
    }

    /// Run parameterless multi-statement SQL. Outside a transaction the batch is
    /// applied atomically by the driver.
    ///
    /// # Errors
    /// Same as [`run_query`](Self::run_query).
    pub async fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.run_fragment(SqlFragment::verbatim(sql), QueryKind::Batch, None)
            .await
            .map(|_| ())
    }

    /// Fluent execution of one statement, with cancellation.
    pub fn query(&self, query: impl Compile) -> QueryBuilder<'_> {
        QueryBuilder::new(self, query.compile())
    }

    /// Begin a deferred transaction. Holds the session gate until finished.
    ///
    /// Until it finishes, statements issued through this handle on the same task join
    /// it, as inside [`transaction`](Self::transaction). Other tasks queue behind it.
    ///
    /// # Errors
    /// `InvalidState`, `ExecutionError` if this task already runs a transaction on
    /// this handle, or the wrapped driver failure.
    pub async fn begin(&self) -> Result<Transaction, DbError> {
        self.begin_with(TransactionBehavior::Deferred).await
    }

    /// Begin a transaction with explicit locking behavior.
    ///
    /// # Errors
    /// Same as [`begin`](Self::begin).
    pub async fn begin_with(&self, behavior: TransactionBehavior) -> Result<Transaction, DbError> {
        self.ensure_accepting()?;
        if let Some(active) = transaction::current_for(self) {
            return Err(DbError::ExecutionError(format!(
                "transaction {} is already active on this task; use it or Database::transaction",
                active.id()
            )));
        }
        let gate = self.acquire_gate(None).await?;
        let id = self
            .session()?
            .begin(behavior)
            .await
            .map_err(|err| self.query_error(&SqlFragment::verbatim(behavior.as_sql()), err))?;
        if !self.inner.suppress_log {
            tracing::debug!(db = %self.inner.name, tx = id, ?behavior, "transaction started");
        }
        let info = TransactionInfo {
            id,
            db_name: self.inner.name.clone(),
            behavior,
        };
        let tx = Transaction::new(self.clone(), info, gate);
        self.inner.begun.record(&tx);
        Ok(tx)
    }

    /// Run `body` in a deferred transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// Statements issued through this handle on the same task join the transaction,
    /// and a nested call reuses it.
    ///
    /// # Errors
    /// The body's error (after rollback), or a begin/commit failure.
    ///
    /// ```rust,no_run
    /// use sql_reactive::prelude::*;
    ///
    /// # async fn demo(db: Database) -> Result<(), DbError> {
    /// db.transaction(|tx| async move {
    ///     tx.run_query(sql!("INSERT INTO notes (body) VALUES ({})", "a")).await?;
    ///     tx.run_query(sql!("INSERT INTO notes (body) VALUES ({})", "b")).await?;
    ///     Ok(())
    /// })
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn transaction<F, Fut, T>(&self, body: F) -> Result<T, DbError>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        self.transaction_with(TransactionBehavior::Deferred, body)
            .await
    }

    /// [`transaction`](Self::transaction) with explicit locking behavior. The behavior
    /// is ignored when an outer transaction is reused.
    ///
    /// # Errors
    /// Same as [`transaction`](Self::transaction).
    pub async fn transaction_with<F, Fut, T>(
        &self,
        behavior: TransactionBehavior,
        body: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        if let Some(outer) = transaction::current_for(self) {
            return body(outer).await;
        }

        let tx = self.begin_with(behavior).await?;
        let outcome = transaction::scope(tx.clone(), body(tx.clone())).await;
        match outcome {
            Ok(value) => {
                if !tx.is_finished() {
                    tx.commit().await?;
                }
                Ok(value)
            }
            Err(err) => {
                if !tx.is_finished() {
                    let id = tx.id();
                    if let Err(rollback_err) = tx.rollback().await {
                        tracing::warn!(db = %self.inner.name, tx = id, error = %rollback_err, "rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    /// Close the handle: notify plugins, wait for the session gate, close the driver.
    /// Idempotent.
    ///
    /// # Errors
    /// `ExecutionError` when called from inside one of this handle's transactions, or
    /// the driver's close failure.
    pub async fn close(&self) -> Result<(), DbError> {
        if transaction::current_for(self).is_some() {
            return Err(DbError::ExecutionError(
                "cannot close a database from inside its own transaction".into(),
            ));
        }
        {
            let mut state = self.lock_state();
            if *state == HandleState::Closed {
                return Ok(());
            }
            *state = HandleState::Closed;
        }
        self.inner.pipeline.close(self).await;
        let _gate = self.acquire_gate(None).await?;
        if let Some(session) = self.inner.handle.get() {
            session.close().await?;
        }
        tracing::info!(db = %self.inner.name, "database closed");
        Ok(())
    }

    pub(crate) async fn run_fragment(
        &self,
        fragment: SqlFragment,
        kind: QueryKind,
        cancel: Option<&CancellationToken>,
    ) -> Result<ResultSet, DbError> {
        match transaction::current_for(self) {
            Some(tx) => tx.run_fragment(fragment, kind, cancel).await,
            None => self.execute(fragment, kind, None, cancel).await,
        }
    }

    /// The query path shared by autocommit statements and transactions: before hooks,
    /// driver dispatch, after hooks in reverse.
    async fn execute(
        &self,
        fragment: SqlFragment,
        kind: QueryKind,
        tx: Option<&TransactionInfo>,
        cancel: Option<&CancellationToken>,
    ) -> Result<ResultSet, DbError> {
        self.ensure_accepting()?;
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(DbError::Cancelled);
        }

        let mut ctx = QueryContext {
            db_name: self.inner.name.clone(),
            fragment,
            kind,
            transaction: tx.cloned(),
        };
        let (entered, short_circuit) = self.inner.pipeline.before_query(self, &mut ctx).await?;

        let result = match short_circuit {
            Some(result) => result,
            None => {
                let result = self.dispatch(&ctx, cancel).await?;
                if cancel.is_some_and(CancellationToken::is_cancelled) {
                    tracing::debug!(db = %self.inner.name, sql = %ctx.fragment.text(), "result discarded after cancellation");
                    return Err(DbError::Cancelled);
                }
                result
            }
        };

        self.inner
            .pipeline
            .after_query(self, &ctx, entered, result)
            .await
    }

    async fn dispatch(
        &self,
        ctx: &QueryContext,
        cancel: Option<&CancellationToken>,
    ) -> Result<ResultSet, DbError> {
        let tx_id = ctx.transaction.as_ref().map(|tx| tx.id);
        // A transaction already owns the gate.
        let _gate = match tx_id {
            Some(_) => None,
            None => Some(self.acquire_gate(cancel).await?),
        };

        let session = self.session()?;
        let started = Instant::now();
        let outcome = match ctx.kind {
            QueryKind::Statement => session.run(&ctx.fragment.to_query(), tx_id).await,
            QueryKind::Batch => session
                .execute_batch(&ctx.fragment.text(), tx_id)
                .await
                .map(|()| ResultSet::default()),
        };
        if !self.inner.suppress_log {
            tracing::debug!(
                db = %self.inner.name,
                tx = ?tx_id,
                elapsed = ?started.elapsed(),
                ok = outcome.is_ok(),
                sql = %ctx.fragment.text(),
                "statement executed"
            );
        }
        outcome.map_err(|err| self.query_error(&ctx.fragment, err))
    }

    async fn acquire_gate(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<OwnedMutexGuard<()>, DbError> {
        let gate = Arc::clone(&self.inner.gate);
        let guard = match cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => return Err(DbError::Cancelled),
                guard = gate.lock_owned() => guard,
            },
            None => gate.lock_owned().await,
        };
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(DbError::Cancelled);
        }
        Ok(guard)
    }

    /// The open driver session.
    pub(crate) fn session(&self) -> Result<&dyn DriverHandle, DbError> {
        self.inner
            .handle
            .get()
            .map(|session| &**session)
            .ok_or_else(|| self.invalid_state(self.state()))
    }

    pub(crate) fn query_error(&self, fragment: &SqlFragment, err: DriverError) -> DbError {
        DbError::Query {
            db_name: self.inner.name.clone(),
            sql: fragment.text(),
            params: fragment.params().to_vec(),
            source: Box::new(DbError::Driver(err)),
        }
    }

    fn ensure_accepting(&self) -> Result<(), DbError> {
        let state = self.state();
        if state.accepts_queries() {
            Ok(())
        } else {
            Err(self.invalid_state(state))
        }
    }

    fn invalid_state(&self, state: HandleState) -> DbError {
        DbError::InvalidState {
            db_name: self.inner.name.clone(),
            state,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: HandleState) {
        let mut state = self.lock_state();
        if *state != HandleState::Closed {
            *state = next;
        }
    }
}

/// Open a database; alias of [`Database::open`].
///
/// # Errors
/// Same as [`Database::open`].
pub async fn open_database(config: DatabaseConfig) -> Result<Database, DbError> {
    Database::open(config).await
}
