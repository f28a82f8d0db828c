use super::{Conditions, QueryNode, arg_to_fragment, eq_condition, in_condition};
use crate::error::CompilationError;
use crate::sql::{Compile, SqlArg, SqlFragment};
use crate::types::RowValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
}

impl JoinKind {
    fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Cross => "CROSS JOIN",
        }
    }
}

/// One `name [(cols…)] AS (body)` term of a WITH clause.
#[derive(Debug, Clone)]
pub struct Cte {
    name: String,
    columns: Vec<String>,
    body: Box<QueryNode>,
}

impl Cte {
    pub fn new(name: impl Into<String>, body: impl Into<QueryNode>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            body: Box::new(body.into()),
        }
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

    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        let mut out = SqlFragment::ident(&self.name);
        if !self.columns.is_empty() {
            let cols: Vec<SqlFragment> = self.columns.iter().map(|c| SqlFragment::ident(c)).collect();
            out.push_str("(");
            out.append(SqlFragment::join(cols, ", ")?);
            out.push_str(")");
        }
        out.push_str(" AS (");
        out.append(self.body.compile()?);
        out.push_str(")");
        Ok(out)
    }
}

pub(crate) fn with_clause(ctes: &[Cte], recursive: bool) -> Result<Option<SqlFragment>, CompilationError> {
    if ctes.is_empty() {
        return Ok(None);
    }
    let terms = ctes.iter().map(Cte::compile).collect::<Result<Vec<_>, _>>()?;
    let mut out = SqlFragment::verbatim(if recursive { "WITH RECURSIVE " } else { "WITH " });
    out.append(SqlFragment::join(terms, ", ")?);
    out.push_str(" ");
    Ok(Some(out))
}

#[derive(Debug, Clone)]
enum Source {
    Table { name: String, alias: Option<String> },
    Subquery { node: Box<QueryNode>, alias: String },
    Expr(SqlFragment),
}

impl Source {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        match self {
            Source::Table { name, alias } => {
                let mut out = SqlFragment::ident(name);
                if let Some(alias) = alias {
                    out.push_str(" AS ");
                    out.append(SqlFragment::ident(alias));
                }
                Ok(out)
            }
            Source::Subquery { node, alias } => {
                let mut out = SqlFragment::verbatim("(");
                out.append(node.compile()?);
                out.push_str(") AS ");
                out.append(SqlFragment::ident(alias));
                Ok(out)
            }
            Source::Expr(fragment) => Ok(fragment.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct Join {
    kind: JoinKind,
    source: Source,
    on: Option<SqlFragment>,
}

#[derive(Debug, Clone)]
struct SelectItem {
    expr: SqlArg,
    alias: Option<String>,
}

impl SelectItem {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        let mut out = arg_to_fragment(self.expr.clone())?;
        if let Some(alias) = &self.alias {
            out.push_str(" AS ");
            out.append(SqlFragment::ident(alias));
        }
        Ok(out)
    }
}

/// SELECT statement builder.
#[derive(Debug, Clone, Default)]
pub struct Select {
    ctes: Vec<Cte>,
    recursive: bool,
    distinct: bool,
    columns: Vec<SelectItem>,
    sources: Vec<Source>,
    joins: Vec<Join>,
    conditions: Conditions,
    group_by: Vec<SqlFragment>,
    having: Conditions,
    order_by: Vec<SqlFragment>,
    limit: Option<RowValues>,
    offset: Option<RowValues>,
}

impl Select {
    /// `SELECT … FROM "table"`.
    pub fn from(table: &str) -> Self {
        Self::new().and_from(table)
    }

    /// A SELECT with no FROM clause yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add another table to a comma-separated FROM list.
    #[must_use]
    pub fn and_from(mut self, table: &str) -> Self {
        self.sources.push(Source::Table {
            name: table.to_string(),
            alias: None,
        });
        self
    }

    #[must_use]
    pub fn from_as(mut self, table: &str, alias: &str) -> Self {
        self.sources.push(Source::Table {
            name: table.to_string(),
            alias: Some(alias.to_string()),
        });
        self
    }

    #[must_use]
    pub fn from_subquery(mut self, node: impl Into<QueryNode>, alias: &str) -> Self {
        self.sources.push(Source::Subquery {
            node: Box::new(node.into()),
            alias: alias.to_string(),
        });
        self
    }

    /// Trusted FROM item such as a table-valued function call.
    #[must_use]
    pub fn from_expr(mut self, fragment: SqlFragment) -> Self {
        self.sources.push(Source::Expr(fragment));
        self
    }

    #[must_use]
    pub fn with(mut self, cte: Cte) -> Self {
        self.ctes.push(cte);
        self
    }

    #[must_use]
    pub fn with_recursive(mut self, cte: Cte) -> Self {
        self.recursive = true;
        self.ctes.push(cte);
        self
    }

    #[must_use]
    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Quoted column names; `*` is passed through.
    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for column in columns {
            let column = column.as_ref();
            let expr = if column == "*" {
                SqlFragment::verbatim("*")
            } else {
                SqlFragment::ident(column)
            };
            self.columns.push(SelectItem {
                expr: expr.into(),
                alias: None,
            });
        }
        self
    }

    #[must_use]
    pub fn column_as(mut self, expr: impl Into<SqlArg>, alias: &str) -> Self {
        self.columns.push(SelectItem {
            expr: expr.into(),
            alias: Some(alias.to_string()),
        });
        self
    }

    /// Trusted expression in the select list.
    #[must_use]
    pub fn expr(mut self, fragment: SqlFragment) -> Self {
        self.columns.push(SelectItem {
            expr: fragment.into(),
            alias: None,
        });
        self
    }

    #[must_use]
    pub fn join(self, table: &str, on: SqlFragment) -> Self {
        self.join_kind(JoinKind::Inner, table, None, Some(on))
    }

    #[must_use]
    pub fn left_join(self, table: &str, on: SqlFragment) -> Self {
        self.join_kind(JoinKind::Left, table, None, Some(on))
    }

    #[must_use]
    pub fn join_as(self, kind: JoinKind, table: &str, alias: &str, on: Option<SqlFragment>) -> Self {
        self.join_kind(kind, table, Some(alias), on)
    }

    fn join_kind(mut self, kind: JoinKind, table: &str, alias: Option<&str>, on: Option<SqlFragment>) -> Self {
        self.joins.push(Join {
            kind,
            source: Source::Table {
                name: table.to_string(),
                alias: alias.map(str::to_string),
            },
            on,
        });
        self
    }

    /// AND a trusted condition fragment (or a nested query used as a boolean).
    #[must_use]
    pub fn where_(mut self, condition: impl Into<SqlArg>) -> Self {
        self.conditions.and(condition.into());
        self
    }

    /// OR a condition against everything added so far.
    #[must_use]
    pub fn or_where(mut self, condition: impl Into<SqlArg>) -> Self {
        self.conditions.or(condition.into());
        self
    }

    /// `"column" = ?` (or `IS NULL` for a null value).
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
    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.group_by
            .extend(columns.into_iter().map(|c| SqlFragment::ident(c.as_ref())));
        self
    }

    #[must_use]
    pub fn having(mut self, condition: impl Into<SqlArg>) -> Self {
        self.having.and(condition.into());
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        let mut term = SqlFragment::ident(column);
        term.push_str(" ");
        term.push_str(order.as_sql());
        self.order_by.push(term);
        self
    }

    #[must_use]
    pub fn order_by_expr(mut self, fragment: SqlFragment) -> Self {
        self.order_by.push(fragment);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: impl Into<RowValues>) -> Self {
        self.limit = Some(limit.into());
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: impl Into<RowValues>) -> Self {
        self.offset = Some(offset.into());
        self
    }

    #[must_use]
    pub fn without_limit(mut self) -> Self {
        self.limit = None;
        self.offset = None;
        self
    }

    #[must_use]
    pub fn without_order(mut self) -> Self {
        self.order_by.clear();
        self
    }
}

pub(crate) fn order_limit_clause(
    order_by: &[SqlFragment],
    limit: Option<&RowValues>,
    offset: Option<&RowValues>,
) -> Result<SqlFragment, CompilationError> {
    let mut out = SqlFragment::empty();
    if !order_by.is_empty() {
        out.push_str(" ORDER BY ");
        out.append(SqlFragment::join(order_by.to_vec(), ", ")?);
    }
    match (limit, offset) {
        (Some(limit), offset) => {
            out.push_str(" LIMIT ");
            out.push_param(limit.clone());
            if let Some(offset) = offset {
                out.push_str(" OFFSET ");
                out.push_param(offset.clone());
            }
        }
        (None, Some(offset)) => {
            out.push_str(" LIMIT -1 OFFSET ");
            out.push_param(offset.clone());
        }
        (None, None) => {}
    }
    Ok(out)
}

impl Compile for Select {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        if !self.having.is_empty() && self.group_by.is_empty() {
            return Err(CompilationError::general("HAVING requires GROUP BY"));
        }

        let mut out = with_clause(&self.ctes, self.recursive)?.unwrap_or_default();
        out.push_str("SELECT ");
        if self.distinct {
            out.push_str("DISTINCT ");
        }
        if self.columns.is_empty() {
            out.push_str("*");
        } else {
            let items = self.columns.iter().map(SelectItem::compile).collect::<Result<Vec<_>, _>>()?;
            out.append(SqlFragment::join(items, ", ")?);
        }

        if !self.sources.is_empty() {
            let sources = self.sources.iter().map(Source::compile).collect::<Result<Vec<_>, _>>()?;
            out.push_str(" FROM ");
            out.append(SqlFragment::join(sources, ", ")?);
        }

        for join in &self.joins {
            if self.sources.is_empty() {
                return Err(CompilationError::general("JOIN requires a FROM table"));
            }
            out.push_str(" ");
            out.push_str(join.kind.as_sql());
            out.push_str(" ");
            out.append(join.source.compile()?);
            if let Some(on) = &join.on {
                out.push_str(" ON ");
                out.append(on.clone());
            }
        }

        if let Some(conditions) = self.conditions.compile()? {
            out.push_str(" WHERE ");
            out.append(conditions);
        }
        if !self.group_by.is_empty() {
            out.push_str(" GROUP BY ");
            out.append(SqlFragment::join(self.group_by.clone(), ", ")?);
        }
        if let Some(having) = self.having.compile()? {
            out.push_str(" HAVING ");
            out.append(having);
        }
        out.append(order_limit_clause(
            &self.order_by,
            self.limit.as_ref(),
            self.offset.as_ref(),
        )?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql;

    #[test]
    fn simple_select_renders_quoted() {
        let frag = Select::from("kv")
            .columns(["key", "value"])
            .where_eq("key", "a")
            .compile()
            .expect("compiles");
        assert_eq!(
            frag.text(),
            r#"SELECT "key", "value" FROM "kv" WHERE ("key" = ?1)"#
        );
    }

    #[test]
    fn joins_ctes_and_grouping() {
        let recent = Select::from("notes").where_(sql!("created_at > {}", 100).expect("sql"));
        let frag = Select::new()
            .from_as("recent", "r")
            .with(Cte::new("recent", recent))
            .column_as(SqlFragment::raw("count(*)").expect("no placeholders"), "n")
            .columns(["r.author_id"])
            .left_join(
                "authors",
                SqlFragment::raw(r#""authors"."id" = "r"."author_id""#).expect("no placeholders"),
            )
            .group_by(["r.author_id"])
            .having(sql!("count(*) > {}", 2).expect("sql"))
            .order_by("n", Order::Desc)
            .limit(5)
            .offset(10)
            .compile()
            .expect("compiles");
        assert_eq!(
            frag.text(),
            concat!(
                r#"WITH "recent" AS (SELECT * FROM "notes" WHERE (created_at > ?1)) "#,
                r#"SELECT count(*) AS "n", "r"."author_id" FROM "recent" AS "r" "#,
                r#"LEFT JOIN "authors" ON "authors"."id" = "r"."author_id" "#,
                r#"GROUP BY "r"."author_id" HAVING (count(*) > ?2) "#,
                r#"ORDER BY "n" DESC LIMIT ?3 OFFSET ?4"#
            )
        );
        assert_eq!(frag.params().len(), frag.placeholder_count());
        assert_eq!(frag.params()[3], RowValues::Int(10));
    }

    #[test]
    fn having_without_group_by_fails() {
        let err = Select::from("kv").having(SqlFragment::raw("1").expect("no placeholders")).compile();
        assert!(err.is_err());
    }

    #[test]
    fn offset_without_limit_uses_unbounded_limit() {
        let frag = Select::from("kv").offset(3).compile().expect("compiles");
        assert_eq!(frag.text(), r#"SELECT * FROM "kv" LIMIT -1 OFFSET ?1"#);
    }

    #[test]
    fn subquery_condition_is_parenthesised() {
        let inner = Select::from("tags").columns(["note_id"]).where_eq("tag", "x");
        let frag = Select::from("notes")
            .where_(sql!("id IN ({})", inner).expect("sql"))
            .compile()
            .expect("compiles");
        assert_eq!(
            frag.text(),
            r#"SELECT * FROM "notes" WHERE (id IN (SELECT "note_id" FROM "tags" WHERE ("tag" = ?1)))"#
        );
    }
}
