use super::select::{Cte, with_clause};
use super::{Conditions, QueryNode, arg_to_fragment, eq_condition, in_condition, returning_clause};
use crate::error::CompilationError;
use crate::sql::{Compile, SqlArg, SqlFragment};
use crate::types::RowValues;

/// `INSERT OR …` / `UPDATE OR …` conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    Replace,
    Ignore,
    Abort,
    Fail,
    Rollback,
}

impl Conflict {
    fn as_sql(self) -> &'static str {
        match self {
            Conflict::Replace => " OR REPLACE",
            Conflict::Ignore => " OR IGNORE",
            Conflict::Abort => " OR ABORT",
            Conflict::Fail => " OR FAIL",
            Conflict::Rollback => " OR ROLLBACK",
        }
    }
}

#[derive(Debug, Clone)]
enum InsertSource {
    Values(Vec<Vec<SqlArg>>),
    Query(Box<QueryNode>),
}

/// INSERT statement builder.
#[derive(Debug, Clone)]
pub struct Insert {
    ctes: Vec<Cte>,
    conflict: Option<Conflict>,
    table: String,
    columns: Vec<String>,
    source: InsertSource,
    returning: Vec<String>,
}

impl Insert {
    pub fn into(table: &str) -> Self {
        Self {
            ctes: Vec::new(),
            conflict: None,
            table: table.to_string(),
            columns: Vec::new(),
            source: InsertSource::Values(Vec::new()),
            returning: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, cte: Cte) -> Self {
        self.ctes.push(cte);
        self
    }

    #[must_use]
    pub fn or(mut self, conflict: Conflict) -> Self {
        self.conflict = Some(conflict);
        self
    }

    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Append one row; values are bound, fragments spliced.
    #[must_use]
    pub fn values<I, V>(mut self, row: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlArg>,
    {
        let row = row.into_iter().map(Into::into).collect();
        match &mut self.source {
            InsertSource::Values(rows) => rows.push(row),
            InsertSource::Query(_) => self.source = InsertSource::Values(vec![row]),
        }
        self
    }

    /// `INSERT INTO t (…) SELECT …`.
    #[must_use]
    pub fn from_query(mut self, node: impl Into<QueryNode>) -> Self {
        self.source = InsertSource::Query(Box::new(node.into()));
        self
    }

    #[must_use]
    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = columns.into_iter().map(Into::into).collect();
        self
    }
}

impl Compile for Insert {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        let mut out = with_clause(&self.ctes, false)?.unwrap_or_default();
        out.push_str("INSERT");
        if let Some(conflict) = self.conflict {
            out.push_str(conflict.as_sql());
        }
        out.push_str(" INTO ");
        out.append(SqlFragment::ident(&self.table));
        if !self.columns.is_empty() {
            let cols = self.columns.iter().map(|c| SqlFragment::ident(c));
            out.push_str(" (");
            out.append(SqlFragment::join(cols, ", ")?);
            out.push_str(")");
        }

        match &self.source {
            InsertSource::Values(rows) => {
                if rows.is_empty() {
                    return Err(CompilationError::general("INSERT has no rows"));
                }
                let mut tuples = Vec::with_capacity(rows.len());
                for (idx, row) in rows.iter().enumerate() {
                    if !self.columns.is_empty() && row.len() != self.columns.len() {
                        return Err(CompilationError::at(
                            idx,
                            format!(
                                "row has {} values for {} columns",
                                row.len(),
                                self.columns.len()
                            ),
                        ));
                    }
                    let cells = row
                        .iter()
                        .cloned()
                        .map(arg_to_fragment)
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|err| CompilationError::at(idx, err.message))?;
                    let mut tuple = SqlFragment::verbatim("(");
                    tuple.append(SqlFragment::join(cells, ", ")?);
                    tuple.push_str(")");
                    tuples.push(tuple);
                }
                out.push_str(" VALUES ");
                out.append(SqlFragment::join(tuples, ", ")?);
            }
            InsertSource::Query(node) => {
                out.push_str(" ");
                out.append(node.compile()?);
            }
        }

        if let Some(returning) = returning_clause(&self.returning) {
            out.append(returning);
        }
        Ok(out)
    }
}

/// UPDATE statement builder.
#[derive(Debug, Clone)]
pub struct Update {
    ctes: Vec<Cte>,
    conflict: Option<Conflict>,
    table: String,
    assignments: Vec<(String, SqlArg)>,
    conditions: Conditions,
    returning: Vec<String>,
}

impl Update {
    pub fn table(table: &str) -> Self {
        Self {
            ctes: Vec::new(),
            conflict: None,
            table: table.to_string(),
            assignments: Vec::new(),
            conditions: Conditions::default(),
            returning: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, cte: Cte) -> Self {
        self.ctes.push(cte);
        self
    }

    #[must_use]
    pub fn or(mut self, conflict: Conflict) -> Self {
        self.conflict = Some(conflict);
        self
    }

    /// `"column" = value`; a fragment value is spliced as an expression.
    #[must_use]
    pub fn set(mut self, column: &str, value: impl Into<SqlArg>) -> Self {
        self.assignments.push((column.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn where_(mut self, condition: impl Into<SqlArg>) -> Self {
        self.conditions.and(condition.into());
        self
    }

    #[must_use]
    pub fn or_where(mut self, condition: impl Into<SqlArg>) -> Self {
        self.conditions.or(condition.into());
        self
    }

    #[must_use]
    pub fn where_eq(self, column: &str, value: impl Into<RowValues>) -> Self {
        self.where_(eq_condition(column, value))
    }

    #[must_use]
    pub fn where_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<RowValues>,
    {
        self.where_(in_condition(column, values))
    }

    #[must_use]
    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = columns.into_iter().map(Into::into).collect();
        self
    }
}

impl Compile for Update {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        if self.assignments.is_empty() {
            return Err(CompilationError::general("UPDATE has no SET assignments"));
        }
        let mut out = with_clause(&self.ctes, false)?.unwrap_or_default();
        out.push_str("UPDATE");
        if let Some(conflict) = self.conflict {
            out.push_str(conflict.as_sql());
        }
        out.push_str(" ");
        out.append(SqlFragment::ident(&self.table));
        out.push_str(" SET ");

        let mut sets = Vec::with_capacity(self.assignments.len());
        for (idx, (column, value)) in self.assignments.iter().enumerate() {
            let value = arg_to_fragment(value.clone())
                .map_err(|err| CompilationError::at(idx, err.message))?;
            let mut set = SqlFragment::ident(column);
            set.push_str(" = ");
            set.append(value);
            sets.push(set);
        }
        out.append(SqlFragment::join(sets, ", ")?);

        if let Some(conditions) = self.conditions.compile()? {
            out.push_str(" WHERE ");
            out.append(conditions);
        }
        if let Some(returning) = returning_clause(&self.returning) {
            out.append(returning);
        }
        Ok(out)
    }
}

/// DELETE statement builder.
#[derive(Debug, Clone)]
pub struct Delete {
    ctes: Vec<Cte>,
    table: String,
    conditions: Conditions,
    returning: Vec<String>,
}

impl Delete {
    pub fn from(table: &str) -> Self {
        Self {
            ctes: Vec::new(),
            table: table.to_string(),
            conditions: Conditions::default(),
            returning: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, cte: Cte) -> Self {
        self.ctes.push(cte);
        self
    }

    #[must_use]
    pub fn where_(mut self, condition: impl Into<SqlArg>) -> Self {
        self.conditions.and(condition.into());
        self
    }

    #[must_use]
    pub fn or_where(mut self, condition: impl Into<SqlArg>) -> Self {
        self.conditions.or(condition.into());
        self
    }

    #[must_use]
    pub fn where_eq(self, column: &str, value: impl Into<RowValues>) -> Self {
        self.where_(eq_condition(column, value))
    }

    #[must_use]
    pub fn where_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<RowValues>,
    {
        self.where_(in_condition(column, values))
    }

    #[must_use]
    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = columns.into_iter().map(Into::into).collect();
        self
    }
}

impl Compile for Delete {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        let mut out = with_clause(&self.ctes, false)?.unwrap_or_default();
        out.push_str("DELETE FROM ");
        out.append(SqlFragment::ident(&self.table));
        if let Some(conditions) = self.conditions.compile()? {
            out.push_str(" WHERE ");
            out.append(conditions);
        }
        if let Some(returning) = returning_clause(&self.returning) {
            out.append(returning);
        }
        Ok(out)
    }
}
