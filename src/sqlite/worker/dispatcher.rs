use std::sync::mpsc::Receiver;
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior as SqliteBehavior};

use crate::error::{DriverError, DriverErrorKind};
use crate::sqlite::SqliteOptions;
use crate::sqlite::query::run_statement;
use crate::types::TransactionBehavior;

use super::channel::Command;

pub(super) fn open_connection(options: &SqliteOptions) -> Result<Connection, DriverError> {
    let conn = Connection::open(&options.path)?;
    conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
    conn.pragma_update(None, "foreign_keys", options.foreign_keys)?;
    if let Some(mode) = &options.journal_mode {
        let applied: String =
            conn.pragma_update_and_check(None, "journal_mode", mode, |row| row.get(0))?;
        tracing::debug!(path = %options.path, requested = %mode, applied = %applied, "sqlite journal mode");
    }
    Ok(conn)
}

pub(super) fn run_sqlite_worker(conn: &mut Connection, receiver: &Receiver<Command>) {
    // Transaction ids never leave this connection; u64 won't exhaust in practice.
    let mut next_tx_id: u64 = 1;

    while let Ok(command) = receiver.recv() {
        match command {
            Command::Shutdown { ack } => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                break;
            }
            Command::Begin {
                behavior,
                respond_to,
            } => match conn.transaction_with_behavior(sqlite_behavior(behavior)) {
                Ok(tx) => {
                    let tx_id = next_tx_id;
                    next_tx_id = next_tx_id.saturating_add(1);
                    let _ = respond_to.send(Ok(tx_id));
                    // The rusqlite::Transaction borrows the connection, so every command
                    // is routed through the tx loop until commit or rollback.
                    if let TxExit::Shutdown = run_tx_loop(tx_id, tx, receiver) {
                        break;
                    }
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err.into()));
                }
            },
            Command::Run {
                tx_id: None,
                query,
                params,
                respond_to,
            } => {
                let _ = respond_to.send(run_statement(conn, &query, &params));
            }
            Command::ExecuteBatch {
                tx_id: None,
                query,
                respond_to,
            } => {
                let _ = respond_to.send(execute_batch(conn, &query));
            }
            Command::Run { respond_to, .. } => {
                let _ = respond_to.send(Err(no_active_tx()));
            }
            Command::ExecuteBatch { respond_to, .. }
            | Command::Commit { respond_to, .. }
            | Command::Rollback { respond_to, .. } => {
                let _ = respond_to.send(Err(no_active_tx()));
            }
        }
    }
}

enum TxExit {
    Finished,
    Shutdown,
}

fn run_tx_loop(tx_id: u64, tx: rusqlite::Transaction<'_>, receiver: &Receiver<Command>) -> TxExit {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Run {
                tx_id: Some(id),
                query,
                params,
                respond_to,
            } => {
                let res = if id == tx_id {
                    run_statement(&tx, &query, &params)
                } else {
                    Err(tx_id_mismatch(tx_id, id))
                };
                let _ = respond_to.send(res);
            }
            Command::ExecuteBatch {
                tx_id: Some(id),
                query,
                respond_to,
            } => {
                let res = if id == tx_id {
                    tx.execute_batch(&query).map_err(DriverError::from)
                } else {
                    Err(tx_id_mismatch(tx_id, id))
                };
                let _ = respond_to.send(res);
            }
            Command::Commit { tx_id: id, respond_to } => {
                if id != tx_id {
                    let _ = respond_to.send(Err(tx_id_mismatch(tx_id, id)));
                    continue;
                }
                let _ = respond_to.send(tx.commit().map_err(DriverError::from));
                return TxExit::Finished;
            }
            Command::Rollback { tx_id: id, respond_to } => {
                if id != tx_id {
                    let _ = respond_to.send(Err(tx_id_mismatch(tx_id, id)));
                    continue;
                }
                let _ = respond_to.send(tx.rollback().map_err(DriverError::from));
                return TxExit::Finished;
            }
            Command::Shutdown { ack } => {
                // Dropping the transaction rolls it back.
                drop(tx);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return TxExit::Shutdown;
            }
            // Everything else is blocked while a transaction is active.
            Command::Begin { respond_to, .. } => {
                let _ = respond_to.send(Err(DriverError::new(
                    DriverErrorKind::Busy,
                    "SQLite transaction already in progress",
                )));
            }
            Command::Run { respond_to, .. } => {
                let _ = respond_to.send(Err(tx_in_progress_error()));
            }
            Command::ExecuteBatch { respond_to, .. } => {
                let _ = respond_to.send(Err(tx_in_progress_error()));
            }
        }
    }
    TxExit::Shutdown
}

fn sqlite_behavior(behavior: TransactionBehavior) -> SqliteBehavior {
    match behavior {
        TransactionBehavior::Deferred => SqliteBehavior::Deferred,
        TransactionBehavior::Immediate => SqliteBehavior::Immediate,
        TransactionBehavior::Exclusive => SqliteBehavior::Exclusive,
    }
}

/// Autocommit batches run atomically.
fn execute_batch(conn: &mut Connection, query: &str) -> Result<(), DriverError> {
    let tx = conn.transaction()?;
    tx.execute_batch(query)?;
    tx.commit()?;
    Ok(())
}

fn tx_id_mismatch(active: u64, requested: u64) -> DriverError {
    DriverError::new(
        DriverErrorKind::Other,
        format!("SQLite transaction mismatch: active {active}, requested {requested}"),
    )
}

fn no_active_tx() -> DriverError {
    DriverError::new(DriverErrorKind::Other, "No active SQLite transaction")
}

fn tx_in_progress_error() -> DriverError {
    DriverError::new(
        DriverErrorKind::Busy,
        "SQLite transaction in progress; operation not permitted",
    )
}
