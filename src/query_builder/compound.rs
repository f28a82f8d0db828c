use super::QueryNode;
use super::select::{Order, order_limit_clause};
use crate::error::CompilationError;
use crate::sql::{Compile, SqlFragment, reject_placeholders};
use crate::types::RowValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    Union,
    UnionAll,
    Intersect,
    Except,
}

impl CompoundOp {
    fn as_sql(self) -> &'static str {
        match self {
            CompoundOp::Union => " UNION ",
            CompoundOp::UnionAll => " UNION ALL ",
            CompoundOp::Intersect => " INTERSECT ",
            CompoundOp::Except => " EXCEPT ",
        }
    }
}

#[derive(Debug, Clone)]
enum Link {
    Op(CompoundOp),
    Separator(String),
}

/// Several statements glued by compound operators or a plain separator.
#[derive(Debug, Clone)]
pub struct Composite {
    parts: Vec<(Option<Link>, QueryNode)>,
    order_by: Vec<SqlFragment>,
    limit: Option<RowValues>,
    offset: Option<RowValues>,
}

impl Composite {
    /// Start a compound select from its first member.
    pub fn first(node: impl Into<QueryNode>) -> Self {
        Self {
            parts: vec![(None, node.into())],
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Join statements with `separator` (e.g. `"; "` for a script).
    pub fn separated<I, N>(nodes: I, separator: &str) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<QueryNode>,
    {
        let parts = nodes
            .into_iter()
            .enumerate()
            .map(|(idx, node)| {
                let link = (idx > 0).then(|| Link::Separator(separator.to_string()));
                (link, node.into())
            })
            .collect();
        Self {
            parts,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    fn push(mut self, op: CompoundOp, node: impl Into<QueryNode>) -> Self {
        self.parts.push((Some(Link::Op(op)), node.into()));
        self
    }

    #[must_use]
    pub fn union(self, node: impl Into<QueryNode>) -> Self {
        self.push(CompoundOp::Union, node)
    }

    #[must_use]
    pub fn union_all(self, node: impl Into<QueryNode>) -> Self {
        self.push(CompoundOp::UnionAll, node)
    }

    #[must_use]
    pub fn intersect(self, node: impl Into<QueryNode>) -> Self {
        self.push(CompoundOp::Intersect, node)
    }

    #[must_use]
    pub fn except(self, node: impl Into<QueryNode>) -> Self {
        self.push(CompoundOp::Except, node)
    }

    /// Order the whole compound result by an output column.
    #[must_use]
    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        let mut term = SqlFragment::ident(column);
        term.push_str(match order {
            Order::Asc => " ASC",
            Order::Desc => " DESC",
        });
        self.order_by.push(term);
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
}

impl Compile for Composite {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        if self.parts.is_empty() {
            return Err(CompilationError::general("composite query has no parts"));
        }
        let has_ops = self.parts.iter().any(|(link, _)| matches!(link, Some(Link::Op(_))));
        if has_ops && self.parts.iter().any(|(link, _)| matches!(link, Some(Link::Separator(_)))) {
            return Err(CompilationError::general(
                "compound operators cannot be mixed with separators",
            ));
        }

        let mut out = SqlFragment::empty();
        for (idx, (link, node)) in self.parts.iter().enumerate() {
            match link {
                Some(Link::Op(op)) => out.push_str(op.as_sql()),
                Some(Link::Separator(separator)) => {
                    reject_placeholders(separator, idx)?;
                    out.push_str(separator);
                }
                None => {}
            }
            let part = node.compile().map_err(|err| {
                CompilationError::at(idx, format!("member failed to compile: {err}"))
            })?;
            out.append(part);
        }
        out.append(order_limit_clause(
            &self.order_by,
            self.limit.as_ref(),
            self.offset.as_ref(),
        )?);
        Ok(out)
    }
}
