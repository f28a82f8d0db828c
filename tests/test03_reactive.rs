#![cfg(feature = "sqlite")]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sql_reactive::prelude::*;
use tokio::sync::mpsc;

mod common;

/// Records every statement and can fail reads on demand.
#[derive(Default)]
struct StatementLog {
    statements: Mutex<Vec<String>>,
    fail_reads: AtomicBool,
}

impl StatementLog {
    fn runs_matching(&self, needle: &str) -> usize {
        self.statements
            .lock()
            .expect("statement log lock")
            .iter()
            .filter(|sql| sql.contains(needle))
            .count()
    }
}

struct LoggingDriver {
    inner: SqliteDriver,
    log: Arc<StatementLog>,
}

struct LoggingHandle {
    inner: Box<dyn DriverHandle>,
    log: Arc<StatementLog>,
}

#[async_trait]
impl Driver for LoggingDriver {
    fn kind(&self) -> &'static str {
        "logging"
    }

    async fn open(&self, config: &DriverConfig) -> Result<Box<dyn DriverHandle>, DriverError> {
        Ok(Box::new(LoggingHandle {
            inner: self.inner.open(config).await?,
            log: Arc::clone(&self.log),
        }))
    }
}

#[async_trait]
impl DriverHandle for LoggingHandle {
    async fn run(&self, query: &QueryAndParams, tx: Option<TxId>) -> Result<ResultSet, DriverError> {
        self.log
            .statements
            .lock()
            .expect("statement log lock")
            .push(query.query.clone());
        if self.log.fail_reads.load(Ordering::SeqCst)
            && query.query.trim_start().starts_with("SELECT")
        {
            return Err(DriverError::new(DriverErrorKind::Busy, "injected read failure"));
        }
        self.inner.run(query, tx).await
    }

    async fn execute_batch(&self, sql: &str, tx: Option<TxId>) -> Result<(), DriverError> {
        self.inner.execute_batch(sql, tx).await
    }

    async fn begin(&self, behavior: TransactionBehavior) -> Result<TxId, DriverError> {
        self.inner.begin(behavior).await
    }

    async fn commit(&self, tx: TxId) -> Result<(), DriverError> {
        self.inner.commit(tx).await
    }

    async fn rollback(&self, tx: TxId) -> Result<(), DriverError> {
        self.inner.rollback(tx).await
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.inner.close().await
    }
}

async fn open_logged() -> Result<(Database, Arc<StatementLog>), DbError> {
    common::init_tracing();
    let log = Arc::new(StatementLog::default());
    let driver = Arc::new(LoggingDriver {
        inner: SqliteDriver::in_memory(),
        log: Arc::clone(&log),
    });
    let db = Database::open(
        DatabaseConfig::new("reactive", driver)
            .migration(Migration::sql(
                1,
                "tables",
                "CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT);
                 CREATE TABLE other (id INTEGER PRIMARY KEY, note TEXT);",
            ))
            .plugin(ReactivePlugin::new())
            .suppress_log(true),
    )
    .await?;
    Ok((db, log))
}

fn channel_listener() -> (
    impl Fn(&ResultSet) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<ResultSet>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |rows: &ResultSet| {
            let _ = tx.send(rows.clone());
        },
        rx,
    )
}

#[tokio::test]
async fn committed_transaction_notifies_once_and_rollback_never() -> Result<(), Box<dyn std::error::Error>> {
    let (db, log) = open_logged().await?;
    let (listener, mut changes) = channel_listener();
    let live = db.subscribe(sql!("SELECT * FROM kv"), listener).await?;
    assert_eq!(live.current().map(|rows| rows.len()), Some(0));
    assert_eq!(log.runs_matching("SELECT * FROM kv"), 1);

    db.transaction(|tx| async move {
        tx.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b")).await?;
        tx.run_query(sql!("UPDATE kv SET value = {} WHERE key = {}", "bb", "a"))
            .await?;
        tx.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "c", "d")).await?;
        Ok(())
    })
    .await?;

    let rows = changes.try_recv()?;
    assert_eq!(rows.len(), 2);
    assert!(changes.try_recv().is_err());
    assert_eq!(log.runs_matching("SELECT * FROM kv"), 2);

    let tx = db.begin().await?;
    tx.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "e", "f")).await?;
    tx.rollback().await?;
    assert!(changes.try_recv().is_err());
    assert_eq!(log.runs_matching("SELECT * FROM kv"), 2);
    assert_eq!(live.current().map(|rows| rows.len()), Some(2));
    Ok(())
}

#[tokio::test]
async fn failed_transaction_body_discards_pending_writes() -> Result<(), Box<dyn std::error::Error>> {
    let (db, log) = open_logged().await?;
    let (listener, mut changes) = channel_listener();
    let _live = db.subscribe(Select::from("kv"), listener).await?;

    let outcome: Result<(), DbError> = db
        .transaction(|tx| async move {
            tx.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b")).await?;
            Err(DbError::ExecutionError("changed my mind".into()))
        })
        .await;
    assert!(outcome.is_err());
    assert!(changes.try_recv().is_err());
    assert_eq!(log.runs_matching("FROM \"kv\""), 1);
    Ok(())
}

#[tokio::test]
async fn autocommit_write_refreshes_immediately() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _log) = open_logged().await?;
    let (listener, mut changes) = channel_listener();
    let live = db
        .subscribe(Select::from("kv").columns(["key"]).order_by("key", Order::Asc), listener)
        .await?;

    db.run_query(Insert::into("kv").columns(["key", "value"]).values(["k", "v"]))
        .await?;
    let rows = changes.try_recv()?;
    assert_eq!(rows.results[0].get("key"), Some(&RowValues::Text("k".into())));
    assert_eq!(live.current(), Some(rows));

    db.execute_batch("DELETE FROM kv; INSERT INTO kv VALUES ('z', 'batch');")
        .await?;
    let rows = changes.try_recv()?;
    assert_eq!(rows.results[0].get("key"), Some(&RowValues::Text("z".into())));
    Ok(())
}

#[tokio::test]
async fn unchanged_results_are_suppressed() -> Result<(), Box<dyn std::error::Error>> {
    let (db, log) = open_logged().await?;
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let _live = db
        .subscribe(sql!("SELECT value FROM kv WHERE key = {}", "watched"), move |_: &ResultSet| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await?;

    db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "unrelated", "x"))
        .await?;
    assert_eq!(log.runs_matching("WHERE key = ?1"), 2);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "watched", "y"))
        .await?;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn writes_to_other_tables_do_not_rerun() -> Result<(), Box<dyn std::error::Error>> {
    let (db, log) = open_logged().await?;
    let (listener, _changes) = channel_listener();
    let live = db.subscribe(sql!("SELECT * FROM kv"), listener).await?;
    assert_eq!(live.tables(), [TableRef::named("kv")].into_iter().collect());

    db.run_query(sql!("INSERT INTO other (note) VALUES ({})", "n")).await?;
    assert_eq!(log.runs_matching("SELECT * FROM kv"), 1);
    Ok(())
}

#[tokio::test]
async fn parameterized_table_depends_on_every_write() -> Result<(), Box<dyn std::error::Error>> {
    let (db, log) = open_logged().await?;
    let (listener, _changes) = channel_listener();
    let live = db
        .subscribe(sql!("SELECT name FROM pragma_table_info({})", "kv"), listener)
        .await?;
    assert!(live.tables().contains(&TableRef::Unknown));
    assert_eq!(live.current().map(|rows| rows.len()), Some(2));

    db.run_query(sql!("INSERT INTO other (note) VALUES ({})", "n")).await?;
    assert_eq!(log.runs_matching("pragma_table_info"), 2);
    Ok(())
}

#[tokio::test]
async fn refresh_failure_keeps_last_result_and_reports_once() -> Result<(), Box<dyn std::error::Error>> {
    let (db, log) = open_logged().await?;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    db.on_reactive_error(move |err: &DbError| {
        sink.lock().expect("errors lock").push(err.to_string());
        assert!(matches!(err, DbError::ReactiveReexecution { .. }));
    })?;

    let (listener, mut changes) = channel_listener();
    let live = db.subscribe(sql!("SELECT * FROM kv"), listener).await?;

    log.fail_reads.store(true, Ordering::SeqCst);
    db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b")).await?;
    assert_eq!(errors.lock().expect("errors lock").len(), 1);
    assert!(changes.try_recv().is_err());
    assert_eq!(live.current().map(|rows| rows.len()), Some(0));
    assert!(live.is_active());

    log.fail_reads.store(false, Ordering::SeqCst);
    db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "c", "d")).await?;
    assert_eq!(changes.try_recv()?.len(), 2);
    assert_eq!(errors.lock().expect("errors lock").len(), 1);
    Ok(())
}

#[tokio::test]
async fn rebinding_recomputes_tables_only_when_the_text_changes() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _log) = open_logged().await?;
    db.run_query(
        Insert::into("kv")
            .columns(["key", "value"])
            .values(["a", "1"])
            .values(["b", "2"]),
    )
    .await?;

    let (listener, mut changes) = channel_listener();
    let live = db
        .subscribe(sql!("SELECT value FROM kv WHERE key = {}", "a"), listener)
        .await?;
    let tables = live.tables();

    live.rebind(sql!("SELECT value FROM kv WHERE key = {}", "b")).await?;
    assert_eq!(live.tables(), tables);
    let rows = changes.try_recv()?;
    assert_eq!(rows.results[0].get("value"), Some(&RowValues::Text("2".into())));

    live.rebind(sql!("SELECT note FROM other")).await?;
    assert_eq!(live.tables(), [TableRef::named("other")].into_iter().collect());
    Ok(())
}

#[tokio::test]
async fn listeners_and_subscriptions_can_be_removed() -> Result<(), Box<dyn std::error::Error>> {
    let (db, log) = open_logged().await?;
    let (listener, mut first) = channel_listener();
    let live = db.subscribe(sql!("SELECT * FROM kv"), listener).await?;
    let (second_listener, mut second) = channel_listener();
    let second_id = live.add_listener(second_listener).ok_or("subscription gone")?;

    db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b")).await?;
    assert!(first.try_recv().is_ok());
    assert!(second.try_recv().is_ok());

    assert!(live.remove_listener(second_id));
    db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "c", "d")).await?;
    assert!(first.try_recv().is_ok());
    assert!(second.try_recv().is_err());

    let engine = db.reactive_engine()?;
    assert_eq!(engine.subscription_count(), 1);
    live.unsubscribe();
    assert_eq!(engine.subscription_count(), 0);

    let before = log.runs_matching("SELECT * FROM kv");
    db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "e", "f")).await?;
    assert_eq!(log.runs_matching("SELECT * FROM kv"), before);
    Ok(())
}

#[tokio::test]
async fn subscribing_requires_the_plugin() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open(
        DatabaseConfig::new("plain", SqliteDriver::builder(":memory:").build()).suppress_log(true),
    )
    .await?;
    let err = db
        .subscribe(sql!("SELECT 1"), |_: &ResultSet| {})
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::PluginMissing("reactive")));
    Ok(())
}

/// Holds every armed SELECT in its after-hook, after the gate is released.
struct SlowReads {
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl Plugin for SlowReads {
    fn name(&self) -> &'static str {
        "slow-reads"
    }

    async fn on_after_query(
        &self,
        _db: &Database,
        ctx: &QueryContext,
        result: ResultSet,
    ) -> Result<ResultSet, DbError> {
        if self.armed.load(Ordering::SeqCst) && !ctx.fragment.is_modify_query() {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        Ok(result)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_during_initial_query_is_not_missed() -> Result<(), Box<dyn std::error::Error>> {
    common::init_tracing();
    let armed = Arc::new(AtomicBool::new(false));
    let db = Database::open(
        DatabaseConfig::new("initial-race", Arc::new(SqliteDriver::in_memory()))
            .migration(Migration::sql(
                1,
                "kv",
                "CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT)",
            ))
            .plugin(SlowReads {
                armed: Arc::clone(&armed),
            })
            .plugin(ReactivePlugin::new())
            .suppress_log(true),
    )
    .await?;
    armed.store(true, Ordering::SeqCst);

    let writer = db.clone();
    let write = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        writer
            .run_query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b"))
            .await
    });

    let (listener, mut rx) = channel_listener();
    let live = db.subscribe(sql!("SELECT * FROM kv"), listener).await?;
    write.await??;

    assert_eq!(live.current().map(|rows| rows.len()), Some(1));
    assert_eq!(rx.try_recv()?.len(), 1);

    armed.store(false, Ordering::SeqCst);
    db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "c", "d")).await?;
    assert_eq!(live.current().map(|rows| rows.len()), Some(2));
    Ok(())
}
