use rusqlite::types::Value;
use tokio::sync::oneshot;

use crate::error::DriverError;
use crate::results::ResultSet;
use crate::types::TransactionBehavior;

pub(in crate::sqlite) type Reply<T> = oneshot::Sender<Result<T, DriverError>>;

pub(in crate::sqlite) enum Command {
    Run {
        tx_id: Option<u64>,
        query: String,
        params: Vec<Value>,
        respond_to: Reply<ResultSet>,
    },
    ExecuteBatch {
        tx_id: Option<u64>,
        query: String,
        respond_to: Reply<()>,
    },
    Begin {
        behavior: TransactionBehavior,
        respond_to: Reply<u64>,
    },
    Commit {
        tx_id: u64,
        respond_to: Reply<()>,
    },
    Rollback {
        tx_id: u64,
        respond_to: Reply<()>,
    },
    Shutdown {
        ack: Option<oneshot::Sender<()>>,
    },
}
