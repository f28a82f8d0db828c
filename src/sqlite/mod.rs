// SQLite adapter for the driver contract
//
// - config: options, builder and JSON loading
// - params: parameter conversion between `RowValues` and SQLite values
// - query: statement execution and result extraction
// - worker: dedicated thread owning the rusqlite connection
// - connection: `SqliteDriver` / `SqliteConnection` trait implementations

pub mod config;
mod connection;
pub mod params;
pub mod query;
mod worker;

pub use config::{SqliteOptions, SqliteOptionsBuilder};
pub use connection::{SqliteConnection, SqliteDriver};

use rusqlite::ErrorCode;

use crate::error::{DriverError, DriverErrorKind};

impl From<rusqlite::Error> for DriverError {
    fn from(err: rusqlite::Error) -> Self {
        let kind = match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => DriverErrorKind::Constraint,
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => DriverErrorKind::Busy,
            // SQLITE_ERROR: syntax errors and missing tables/columns.
            Some(ErrorCode::Unknown) => DriverErrorKind::Syntax,
            _ => DriverErrorKind::Other,
        };
        DriverError::new(kind, err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_sqlite_error_codes() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .expect("create");
        conn.execute("INSERT INTO t (id) VALUES (1)", [])
            .expect("insert");

        let dup = conn
            .execute("INSERT INTO t (id) VALUES (1)", [])
            .expect_err("duplicate key");
        assert_eq!(DriverError::from(dup).kind, DriverErrorKind::Constraint);

        let missing = conn
            .execute("INSERT INTO nope (id) VALUES (1)", [])
            .expect_err("missing table");
        assert_eq!(DriverError::from(missing).kind, DriverErrorKind::Syntax);
    }
}
