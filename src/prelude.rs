//! Convenient imports for common functionality.
//!
//! `use sql_reactive::prelude::*;` brings in the handle, the builders, the `sql!`
//! macro and the extension traits needed to call them.

pub use crate::database::{Database, DatabaseConfig, HandleState, Transaction, open_database};
pub use crate::driver::{Driver, DriverConfig, DriverHandle, TxId};
pub use crate::error::{CompilationError, DbError, DriverError, DriverErrorKind};
pub use crate::migrations::{Migration, MigrationRunner};
pub use crate::plugin::{Plugin, QueryContext, QueryKind, TransactionInfo};
pub use crate::query_builder::{
    Composite, CompoundOp, Conflict, Cte, Delete, Insert, JoinKind, Order, QueryNode, Select,
    Update,
};
pub use crate::reactive::{ReactivePlugin, ReactiveQueries, Subscription};
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::sql::{Compile, SqlArg, SqlFragment, Template};
pub use crate::sql;
pub use crate::tracker::TableRef;
pub use crate::types::{QueryAndParams, RowValues, TransactionBehavior};

#[cfg(feature = "sqlite")]
pub use crate::sqlite::{SqliteDriver, SqliteOptions, SqliteOptionsBuilder};
