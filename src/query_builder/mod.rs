//! Composable statement builders that compile to [`SqlFragment`]s.
//!
//! ```rust
//! use sql_reactive::prelude::*;
//!
//! # fn demo() -> Result<(), CompilationError> {
//! let query = Select::from("notes")
//!     .columns(["id", "title"])
//!     .where_eq("archived", false)
//!     .order_by("id", Order::Desc)
//!     .limit(10)
//!     .compile()?;
//! assert_eq!(
//!     query.text(),
//!     r#"SELECT "id", "title" FROM "notes" WHERE ("archived" = ?1) ORDER BY "id" DESC LIMIT ?2"#
//! );
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use crate::error::CompilationError;
use crate::sql::{Compile, SqlArg, SqlFragment};
use crate::types::RowValues;

mod compound;
mod dml;
mod select;

pub use compound::{Composite, CompoundOp};
pub use dml::{Conflict, Delete, Insert, Update};
pub use select::{Cte, JoinKind, Order, Select};

/// Any statement the builder can produce.
#[derive(Debug, Clone)]
pub enum QueryNode {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Raw(SqlFragment),
    Composite(Composite),
}

impl Compile for QueryNode {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        match self {
            QueryNode::Select(node) => node.compile(),
            QueryNode::Insert(node) => node.compile(),
            QueryNode::Update(node) => node.compile(),
            QueryNode::Delete(node) => node.compile(),
            QueryNode::Raw(fragment) => Ok(fragment.clone()),
            QueryNode::Composite(node) => node.compile(),
        }
    }
}

macro_rules! node_from {
    ($($ty:ident),*) => {
        $(
            impl From<$ty> for QueryNode {
                fn from(value: $ty) -> Self {
                    QueryNode::$ty(value)
                }
            }

            impl From<$ty> for SqlArg {
                fn from(value: $ty) -> Self {
                    SqlArg::Node(Box::new(QueryNode::$ty(value)))
                }
            }
        )*
    };
}

node_from!(Select, Insert, Update, Delete, Composite);

impl From<SqlFragment> for QueryNode {
    fn from(value: SqlFragment) -> Self {
        QueryNode::Raw(value)
    }
}

/// A condition, a SELECT list entry or any other expression slot.
///
/// Builders accept either trusted fragments or bare values; values are bound.
pub(crate) fn arg_to_fragment(arg: SqlArg) -> Result<SqlFragment, CompilationError> {
    match arg {
        SqlArg::Value(RowValues::Float(f)) if !f.is_finite() => Err(CompilationError::general(
            format!("non-finite float {f} cannot be bound"),
        )),
        SqlArg::Value(value) => Ok(SqlFragment::param(value)),
        SqlArg::Fragment(fragment) => Ok(fragment),
        SqlArg::Node(node) => {
            let mut out = SqlFragment::verbatim("(");
            out.append(node.compile()?);
            out.push_str(")");
            Ok(out)
        }
    }
}

/// Accumulated WHERE/HAVING conditions.
#[derive(Debug, Clone, Default)]
pub(crate) struct Conditions {
    clauses: Vec<(bool, SqlArg)>,
}

impl Conditions {
    pub(crate) fn and(&mut self, condition: SqlArg) {
        self.clauses.push((false, condition));
    }

    pub(crate) fn or(&mut self, condition: SqlArg) {
        self.clauses.push((true, condition));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// `a AND b`, with `or` entries grouping everything before them: `(a AND b) OR c`.
    pub(crate) fn compile(&self) -> Result<Option<SqlFragment>, CompilationError> {
        let mut out: Option<SqlFragment> = None;
        for (is_or, clause) in &self.clauses {
            let mut part = SqlFragment::verbatim("(");
            part.append(arg_to_fragment(clause.clone())?);
            part.push_str(")");
            out = Some(match out {
                None => part,
                Some(acc) if *is_or => {
                    let mut grouped = SqlFragment::verbatim("(");
                    grouped.append(acc);
                    grouped.push_str(") OR ");
                    grouped.appended(part)
                }
                Some(acc) => acc.appended(SqlFragment::verbatim(" AND ")).appended(part),
            });
        }
        Ok(out)
    }
}

pub(crate) fn eq_condition(column: &str, value: impl Into<RowValues>) -> SqlFragment {
    let value = value.into();
    let mut out = SqlFragment::ident(column);
    if value.is_null() {
        out.push_str(" IS NULL");
    } else {
        out.push_str(" = ");
        out.push_param(value);
    }
    out
}

pub(crate) fn in_condition<I, V>(column: &str, values: I) -> SqlFragment
where
    I: IntoIterator<Item = V>,
    V: Into<RowValues>,
{
    let params: Vec<SqlFragment> = values.into_iter().map(SqlFragment::param).collect();
    if params.is_empty() {
        // `x IN ()` is a syntax error in SQLite; an empty list never matches.
        return SqlFragment::verbatim("0");
    }
    let mut out = SqlFragment::ident(column);
    out.push_str(" IN (");
    if let Ok(list) = SqlFragment::join(params, ", ") {
        out.append(list);
    }
    out.push_str(")");
    out
}

pub(crate) fn returning_clause(columns: &[String]) -> Option<SqlFragment> {
    if columns.is_empty() {
        return None;
    }
    let list = columns
        .iter()
        .map(|c| if c == "*" { "*".to_string() } else { SqlFragment::ident(c).text() })
        .collect::<Vec<_>>()
        .join(", ");
    Some(SqlFragment::verbatim(format!(" RETURNING {list}")))
}

/// `INSERT [OR REPLACE] INTO table (cols…) VALUES (…), (…)` from column/value maps.
///
/// Column names come from the first row; every row must carry the same keys.
///
/// # Errors
/// Returns [`CompilationError`] for an empty row list or rows with differing keys.
pub fn generate_insert(
    table: &str,
    rows: &[BTreeMap<String, RowValues>],
    replace: bool,
) -> Result<SqlFragment, CompilationError> {
    let Some(first) = rows.first() else {
        return Err(CompilationError::general("cannot insert an empty row list"));
    };
    let columns: Vec<String> = first.keys().cloned().collect();
    let mut insert = Insert::into(table).columns(columns.iter().map(String::as_str));
    if replace {
        insert = insert.or(Conflict::Replace);
    }
    for (idx, row) in rows.iter().enumerate() {
        if row.len() != columns.len() || !columns.iter().all(|c| row.contains_key(c)) {
            return Err(CompilationError::at(
                idx,
                "row keys differ from the first row",
            ));
        }
        insert = insert.values(columns.iter().map(|c| row[c].clone()));
    }
    insert.compile()
}

/// `UPDATE table SET col = ?, …` for every entry of `values`; no WHERE clause.
///
/// # Errors
/// Returns [`CompilationError`] when `values` is empty.
pub fn generate_update(
    table: &str,
    values: &BTreeMap<String, RowValues>,
) -> Result<SqlFragment, CompilationError> {
    values
        .iter()
        .fold(Update::table(table), |update, (column, value)| {
            update.set(column, value.clone())
        })
        .compile()
}
