use tokio_util::sync::CancellationToken;

use crate::database::Database;
use crate::error::{CompilationError, DbError};
use crate::plugin::QueryKind;
use crate::results::{CustomDbRow, ResultSet};
use crate::sql::SqlFragment;

/// Fluent builder for executing one statement against a [`Database`].
///
/// ```rust,no_run
/// use sql_reactive::prelude::*;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo(db: Database) -> Result<(), DbError> {
/// let token = CancellationToken::new();
/// let rows = db
///     .query(Select::from("notes").where_eq("id", 7))
///     .cancel_on(token.clone())
///     .select()
///     .await?;
/// # let _ = rows;
/// # Ok(())
/// # }
/// ```
pub struct QueryBuilder<'db> {
    db: &'db Database,
    fragment: Result<SqlFragment, CompilationError>,
    cancel: Option<CancellationToken>,
}

impl<'db> QueryBuilder<'db> {
    pub(crate) fn new(db: &'db Database, fragment: Result<SqlFragment, CompilationError>) -> Self {
        Self {
            db,
            fragment,
            cancel: None,
        }
    }

    /// Cancel the statement when `token` fires. Before dispatch nothing reaches the
    /// driver; after dispatch the result is discarded and after-hooks are skipped.
    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Execute and return the result set.
    ///
    /// # Errors
    /// `Compilation` if the statement failed to compile, `Cancelled`, or any error
    /// from [`Database::run_query`].
    pub async fn select(self) -> Result<ResultSet, DbError> {
        let fragment = self.fragment?;
        self.db
            .run_fragment(fragment, QueryKind::Statement, self.cancel.as_ref())
            .await
    }

    /// Execute a DML statement and return rows affected.
    ///
    /// # Errors
    /// Same as [`select`](Self::select).
    pub async fn dml(self) -> Result<usize, DbError> {
        Ok(self.select().await?.rows_affected)
    }

    /// Execute and return the first row, if any.
    ///
    /// # Errors
    /// Same as [`select`](Self::select).
    pub async fn first(self) -> Result<Option<CustomDbRow>, DbError> {
        Ok(self.select().await?.results.into_iter().next())
    }
}
