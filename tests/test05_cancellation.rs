#![cfg(feature = "sqlite")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sql_reactive::prelude::*;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

mod common;

/// Cancels an armed token right after the next statement reaches the engine.
#[derive(Default)]
struct Tripwire {
    armed: Mutex<Option<CancellationToken>>,
}

impl Tripwire {
    fn arm(&self, token: CancellationToken) {
        *self.armed.lock().expect("tripwire lock") = Some(token);
    }
}

struct TripwireDriver {
    inner: SqliteDriver,
    tripwire: Arc<Tripwire>,
}

struct TripwireHandle {
    inner: Box<dyn DriverHandle>,
    tripwire: Arc<Tripwire>,
}

#[async_trait]
impl Driver for TripwireDriver {
    fn kind(&self) -> &'static str {
        "tripwire"
    }

    async fn open(&self, config: &DriverConfig) -> Result<Box<dyn DriverHandle>, DriverError> {
        Ok(Box::new(TripwireHandle {
            inner: self.inner.open(config).await?,
            tripwire: Arc::clone(&self.tripwire),
        }))
    }
}

#[async_trait]
impl DriverHandle for TripwireHandle {
    async fn run(&self, query: &QueryAndParams, tx: Option<TxId>) -> Result<ResultSet, DriverError> {
        let result = self.inner.run(query, tx).await;
        let armed = self.tripwire.armed.lock().expect("tripwire lock").take();
        if let Some(token) = armed {
            token.cancel();
        }
        result
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

async fn open_db() -> Result<(Database, Arc<Tripwire>), DbError> {
    common::init_tracing();
    let tripwire = Arc::new(Tripwire::default());
    let driver = Arc::new(TripwireDriver {
        inner: SqliteDriver::in_memory(),
        tripwire: Arc::clone(&tripwire),
    });
    let db = Database::open(
        DatabaseConfig::new("cancellation", driver)
            .migration(Migration::sql(
                1,
                "kv",
                "CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT)",
            ))
            .plugin(ReactivePlugin::new())
            .suppress_log(true),
    )
    .await?;
    Ok((db, tripwire))
}

async fn count(db: &Database) -> Result<i64, DbError> {
    let row = db
        .query(sql!("SELECT count(*) AS n FROM kv"))
        .first()
        .await?;
    match row.as_ref().and_then(|r| r.get("n")) {
        Some(RowValues::Int(n)) => Ok(*n),
        other => Err(DbError::ExecutionError(format!("unexpected count {other:?}"))),
    }
}

#[tokio::test]
async fn cancelled_before_dispatch_never_reaches_the_driver() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _) = open_db().await?;
    let token = CancellationToken::new();
    token.cancel();

    let err = db
        .query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b"))
        .cancel_on(token)
        .dml()
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(count(&db).await?, 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_while_waiting_for_the_gate() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _) = open_db().await?;
    let tx = db.begin().await?;

    let token = CancellationToken::new();
    let waiter = {
        let db = db.clone();
        let token = token.clone();
        tokio::spawn(async move {
            db.query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b"))
                .cancel_on(token)
                .dml()
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let outcome = timeout(Duration::from_secs(5), waiter).await??;
    assert!(matches!(outcome, Err(DbError::Cancelled)));
    tx.rollback().await?;
    assert_eq!(count(&db).await?, 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_after_dispatch_discards_the_result() -> Result<(), Box<dyn std::error::Error>> {
    let (db, tripwire) = open_db().await?;
    let (sender, mut changes) = tokio::sync::mpsc::unbounded_channel();
    let live = db
        .subscribe(sql!("SELECT * FROM kv"), move |rows: &ResultSet| {
            let _ = sender.send(rows.len());
        })
        .await?;

    let token = CancellationToken::new();
    tripwire.arm(token.clone());
    let err = db
        .query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b"))
        .cancel_on(token)
        .dml()
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Cancelled));

    // The engine applied the write, but after-hooks never saw it.
    assert_eq!(count(&db).await?, 1);
    assert!(changes.try_recv().is_err());
    assert_eq!(live.current().map(|rows| rows.len()), Some(0));
    Ok(())
}

#[tokio::test]
async fn handle_statements_join_the_task_transaction() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _) = open_db().await?;
    let handle = &db;

    let body = handle.transaction(|_tx| async move {
        handle
            .run_query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b"))
            .await?;
        assert_eq!(count(handle).await?, 1);
        Err::<(), _>(DbError::ExecutionError("abort".into()))
    });
    let err = timeout(Duration::from_secs(5), body).await?.unwrap_err();
    assert!(matches!(err, DbError::ExecutionError(_)));
    assert_eq!(count(&db).await?, 0);
    Ok(())
}

#[tokio::test]
async fn nested_transaction_reuses_the_outer_one() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _) = open_db().await?;
    let handle = &db;

    let err = handle
        .transaction(|outer| async move {
            let outer_id = outer.id();
            let inner_id = handle
                .transaction(|inner| async move {
                    inner
                        .run_query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b"))
                        .await?;
                    Ok(inner.id())
                })
                .await?;
            assert_eq!(inner_id, outer_id);
            assert!(!outer.is_finished());
            Err::<(), _>(DbError::ExecutionError("abort outer".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ExecutionError(_)));
    assert_eq!(count(&db).await?, 0);
    Ok(())
}

#[tokio::test]
async fn begin_inside_a_transaction_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _) = open_db().await?;
    let handle = &db;
    handle
        .transaction(|_tx| async move {
            let err = handle.begin().await.unwrap_err();
            assert!(matches!(err, DbError::ExecutionError(_)));
            let err = handle.close().await.unwrap_err();
            assert!(matches!(err, DbError::ExecutionError(_)));
            Ok(())
        })
        .await?;
    assert_eq!(db.state(), HandleState::Ready);
    Ok(())
}

#[tokio::test]
async fn handle_statements_join_a_begun_transaction() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _) = open_db().await?;
    let tx = db.begin().await?;
    tx.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b")).await?;

    assert_eq!(timeout(Duration::from_secs(2), count(&db)).await??, 1);
    timeout(
        Duration::from_secs(2),
        db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "c", "d")),
    )
    .await??;
    assert_eq!(timeout(Duration::from_secs(2), count(&db)).await??, 2);

    let err = db.begin().await.unwrap_err();
    assert!(matches!(err, DbError::ExecutionError(_)));
    let err = db.close().await.unwrap_err();
    assert!(matches!(err, DbError::ExecutionError(_)));

    tx.rollback().await?;
    assert_eq!(count(&db).await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_writers_wait_for_commit_in_submission_order() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _) = open_db().await?;
    let tx = db.begin().await?;
    tx.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "tx", "first")).await?;

    let mut writers = Vec::new();
    for n in 0..6 {
        let db = db.clone();
        let key = format!("w{n}");
        writers.push(tokio::spawn(async move {
            if n % 2 == 0 {
                db.run_query(sql!("INSERT INTO kv VALUES ({}, {})", key.as_str(), "auto"))
                    .await?;
            } else {
                db.transaction(|tx| async move {
                    tx.run_query(sql!("INSERT INTO kv VALUES ({}, {})", key.as_str(), "tx"))
                        .await?;
                    Ok(())
                })
                .await?;
            }
            Ok::<(), DbError>(())
        }));
        // Lets each writer reach the gate before the next one is spawned.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(writers.iter().all(|writer| !writer.is_finished()));
    let rows = tx.run_query(sql!("SELECT count(*) AS n FROM kv")).await?;
    assert_eq!(rows.results[0].get("n"), Some(&RowValues::Int(1)));
    tx.commit().await?;

    for writer in writers {
        timeout(Duration::from_secs(5), writer).await???;
    }
    let rows = db.run_query(sql!("SELECT key FROM kv ORDER BY rowid")).await?;
    let keys: Vec<&str> = rows
        .results
        .iter()
        .filter_map(|row| row.get("key").and_then(RowValues::as_text))
        .collect();
    assert_eq!(keys, ["tx", "w0", "w1", "w2", "w3", "w4", "w5"]);
    Ok(())
}

#[tokio::test]
async fn dropped_transaction_rolls_back() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _) = open_db().await?;
    let tx = db.begin().await?;
    tx.run_query(sql!("INSERT INTO kv VALUES ({}, {})", "a", "b")).await?;
    drop(tx);

    // Waits on the gate until the background rollback releases it.
    assert_eq!(timeout(Duration::from_secs(5), count(&db)).await??, 0);
    Ok(())
}

#[tokio::test]
async fn finished_transaction_refuses_statements() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _) = open_db().await?;
    let tx = db.begin().await?;
    let id = tx.id();
    let stale = tx.clone();
    tx.commit().await?;

    let err = stale.run_query(sql!("SELECT 1")).await.unwrap_err();
    assert!(matches!(err, DbError::TransactionFinished(finished) if finished == id));
    let err = stale.rollback().await.unwrap_err();
    assert!(matches!(err, DbError::TransactionFinished(_)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_are_serialized() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _) = open_db().await?;
    let mut writers = Vec::new();
    for writer in 0..4 {
        let db = db.clone();
        writers.push(tokio::spawn(async move {
            for n in 0..10 {
                let key = format!("{writer}-{n}");
                db.transaction_with(TransactionBehavior::Immediate, |tx| async move {
                    tx.run_query(sql!("INSERT INTO kv VALUES ({}, {})", key.as_str(), "v"))
                        .await?;
                    Ok(())
                })
                .await?;
                db.run_query(sql!("UPDATE kv SET value = {} WHERE key = {}", "w", format!("{writer}-{n}")))
                    .await?;
            }
            Ok::<(), DbError>(())
        }));
    }
    for writer in writers {
        writer.await??;
    }
    assert_eq!(count(&db).await?, 40);
    Ok(())
}
