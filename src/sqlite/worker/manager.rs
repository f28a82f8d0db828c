use std::sync::mpsc::{self, Sender};
use std::thread;

use rusqlite::types::Value;
use tokio::sync::oneshot;

use crate::error::DriverError;
use crate::results::ResultSet;
use crate::sqlite::SqliteOptions;
use crate::types::TransactionBehavior;

use super::channel::{Command, Reply};
use super::dispatcher::{open_connection, run_sqlite_worker};

pub(in crate::sqlite) struct SqliteWorker {
    sender: Sender<Command>,
}

impl SqliteWorker {
    /// Spawn the worker thread and wait until it has opened and configured the
    /// connection.
    pub(in crate::sqlite) async fn spawn(name: &str, options: SqliteOptions) -> Result<Self, DriverError> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), DriverError>>();

        thread::Builder::new()
            .name(format!("sqlite-worker-{name}"))
            .spawn(move || match open_connection(&options) {
                Ok(mut conn) => {
                    if ready_tx.send(Ok(())).is_ok() {
                        run_sqlite_worker(&mut conn, &receiver);
                    }
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .map_err(|err| {
                DriverError::closed(format!("failed to spawn SQLite worker thread: {err}"))
                    .with_source(err)
            })?;

        ready_rx
            .await
            .map_err(|_| DriverError::closed("SQLite worker exited during open"))??;
        Ok(Self { sender })
    }

    fn send_command(&self, command: Command) -> Result<(), DriverError> {
        self.sender
            .send(command)
            .map_err(|_| DriverError::closed("SQLite worker closed"))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
        drop_message: &'static str,
    ) -> Result<T, DriverError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx))?;
        rx.await.map_err(|_| DriverError::closed(drop_message))?
    }

    pub(in crate::sqlite) async fn run(
        &self,
        tx_id: Option<u64>,
        query: String,
        params: Vec<Value>,
    ) -> Result<ResultSet, DriverError> {
        self.request(
            |respond_to| Command::Run {
                tx_id,
                query,
                params,
                respond_to,
            },
            "SQLite worker dropped while running statement",
        )
        .await
    }

    pub(in crate::sqlite) async fn execute_batch(&self, tx_id: Option<u64>, query: String) -> Result<(), DriverError> {
        self.request(
            |respond_to| Command::ExecuteBatch {
                tx_id,
                query,
                respond_to,
            },
            "SQLite worker dropped while executing batch",
        )
        .await
    }

    pub(in crate::sqlite) async fn begin(&self, behavior: TransactionBehavior) -> Result<u64, DriverError> {
        self.request(
            |respond_to| Command::Begin {
                behavior,
                respond_to,
            },
            "SQLite worker dropped while beginning transaction",
        )
        .await
    }

    pub(in crate::sqlite) async fn commit(&self, tx_id: u64) -> Result<(), DriverError> {
        self.request(
            |respond_to| Command::Commit { tx_id, respond_to },
            "SQLite worker dropped while committing",
        )
        .await
    }

    pub(in crate::sqlite) async fn rollback(&self, tx_id: u64) -> Result<(), DriverError> {
        self.request(
            |respond_to| Command::Rollback { tx_id, respond_to },
            "SQLite worker dropped while rolling back",
        )
        .await
    }

    /// Stop the worker and wait for the connection to be dropped.
    pub(in crate::sqlite) async fn shutdown(&self) -> Result<(), DriverError> {
        let (ack, done) = oneshot::channel();
        self.send_command(Command::Shutdown { ack: Some(ack) })?;
        // A dropped ack means the thread already exited, which is what we want.
        let _ = done.await;
        Ok(())
    }
}

impl Drop for SqliteWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown { ack: None });
    }
}
