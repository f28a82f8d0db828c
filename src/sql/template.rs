use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;

use super::scanner::{TokenKind, tokenize};
use super::{Compile, SqlFragment};
use crate::error::CompilationError;
use crate::query_builder::QueryNode;
use crate::types::RowValues;

/// One interpolated template argument.
#[derive(Debug, Clone)]
pub enum SqlArg {
    /// Bound as a placeholder plus parameter.
    Value(RowValues),
    /// Spliced in place with its parameters renumbered.
    Fragment(SqlFragment),
    /// Compiled first, then spliced.
    Node(Box<QueryNode>),
}

macro_rules! sql_arg_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for SqlArg {
                fn from(value: $ty) -> Self {
                    SqlArg::Value(value.into())
                }
            }
        )*
    };
}

sql_arg_from_value!(
    RowValues,
    i64,
    i32,
    u32,
    i16,
    u8,
    f64,
    f32,
    String,
    &str,
    &String,
    bool,
    NaiveDateTime,
    JsonValue,
    Vec<u8>,
    &[u8],
);

impl<T: Into<RowValues>> From<Option<T>> for SqlArg {
    fn from(value: Option<T>) -> Self {
        SqlArg::Value(RowValues::from(value))
    }
}

impl From<SqlFragment> for SqlArg {
    fn from(value: SqlFragment) -> Self {
        SqlArg::Fragment(value)
    }
}

impl From<&SqlFragment> for SqlArg {
    fn from(value: &SqlFragment) -> Self {
        SqlArg::Fragment(value.clone())
    }
}

impl From<QueryNode> for SqlArg {
    fn from(value: QueryNode) -> Self {
        SqlArg::Node(Box::new(value))
    }
}

/// A `{}`-marker SQL template with its arguments.
///
/// `{{` and `}}` produce literal braces; any other brace is copied as-is.
#[derive(Debug, Clone)]
pub struct Template {
    text: String,
    args: Vec<SqlArg>,
}

enum Piece {
    Literal(String),
    /// Byte offset of the `{}` in the template text.
    Marker(usize),
}

impl Template {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<SqlArg>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Compile the template into a single fragment.
    ///
    /// # Errors
    /// Returns [`CompilationError`] on marker/argument count mismatch, a placeholder
    /// written into the template text, non-finite floats, or when a nested builder
    /// node fails to compile.
    pub fn compile(&self) -> Result<SqlFragment, CompilationError> {
        let pieces = split_markers(&self.text);
        let offsets: Vec<usize> = pieces
            .iter()
            .filter_map(|p| match p {
                Piece::Marker(offset) => Some(*offset),
                Piece::Literal(_) => None,
            })
            .collect();
        let markers = offsets.len();
        if markers != self.args.len() {
            return Err(CompilationError::at(
                markers.min(self.args.len()),
                format!(
                    "template has {markers} markers but {} arguments were supplied",
                    self.args.len()
                ),
            ));
        }

        // Scanned as a whole so quotes spanning a marker keep their meaning.
        if let Some(token) = tokenize(&self.text)
            .into_iter()
            .find(|t| t.kind == TokenKind::Placeholder)
        {
            let position = offsets.iter().filter(|&&o| o < token.start).count();
            return Err(CompilationError::at(
                position,
                format!(
                    "placeholder '{}' in template text; use {{}} to bind values",
                    token.text
                ),
            ));
        }

        let mut out = SqlFragment::empty();
        let mut args = self.args.iter().enumerate();
        for piece in pieces {
            match piece {
                Piece::Literal(text) => out.push_str(&text),
                Piece::Marker(_) => {
                    let Some((position, arg)) = args.next() else {
                        break;
                    };
                    splice_arg(&mut out, position, arg)?;
                }
            }
        }
        Ok(out)
    }
}

impl Compile for Template {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        Template::compile(self)
    }
}

fn splice_arg(out: &mut SqlFragment, position: usize, arg: &SqlArg) -> Result<(), CompilationError> {
    match arg {
        SqlArg::Value(RowValues::Float(f)) if !f.is_finite() => Err(CompilationError::at(
            position,
            format!("non-finite float {f} cannot be bound"),
        )),
        SqlArg::Value(value) => {
            out.push_param(value.clone());
            Ok(())
        }
        SqlArg::Fragment(fragment) => {
            out.append(fragment.clone());
            Ok(())
        }
        SqlArg::Node(node) => {
            let fragment = node.compile().map_err(|err| {
                CompilationError::at(position, format!("nested query failed to compile: {err}"))
            })?;
            out.append(fragment);
            Ok(())
        }
    }
}

fn split_markers(text: &str) -> Vec<Piece> {
    let bytes = text.as_bytes();
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut run_start = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        let pair = (bytes[idx], bytes.get(idx + 1).copied());
        let step = match pair {
            (b'{', Some(b'}')) => {
                literal.push_str(&text[run_start..idx]);
                if !literal.is_empty() {
                    pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                }
                pieces.push(Piece::Marker(idx));
                2
            }
            (b'{', Some(b'{')) | (b'}', Some(b'}')) => {
                literal.push_str(&text[run_start..=idx]);
                2
            }
            _ => {
                idx += 1;
                continue;
            }
        };
        idx += step;
        run_start = idx;
    }
    literal.push_str(&text[run_start..]);
    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_become_placeholders() {
        let frag = Template::new("SELECT * FROM kv WHERE key = {} AND n > {}")
            .arg("a")
            .arg(3)
            .compile()
            .expect("compiles");
        assert_eq!(frag.text(), "SELECT * FROM kv WHERE key = ?1 AND n > ?2");
        assert_eq!(frag.params(), &[RowValues::Text("a".into()), RowValues::Int(3)]);
    }

    #[test]
    fn fragments_splice_and_renumber() {
        let filter = Template::new("value IN ({}, {})")
            .arg("x")
            .arg("y")
            .compile()
            .expect("compiles");
        let frag = Template::new("SELECT {} FROM kv WHERE key = {} AND {}")
            .arg(SqlFragment::ident("value"))
            .arg("k")
            .arg(filter)
            .compile()
            .expect("compiles");
        assert_eq!(
            frag.text(),
            r#"SELECT "value" FROM kv WHERE key = ?1 AND value IN (?2, ?3)"#
        );
        assert_eq!(frag.params().len(), 3);
    }

    #[test]
    fn escaped_braces_are_literal() {
        let frag = Template::new("SELECT '{{}}' || {} || '}'")
            .arg("x")
            .compile()
            .expect("compiles");
        assert_eq!(frag.text(), "SELECT '{}' || ?1 || '}'");
    }

    #[test]
    fn non_finite_float_names_position() {
        let err = Template::new("VALUES ({}, {})")
            .arg(1.5)
            .arg(f64::NAN)
            .compile()
            .unwrap_err();
        assert_eq!(err.position, Some(1));
    }

    #[test]
    fn count_mismatch_is_an_error() {
        assert!(Template::new("a = {} AND b = {}").arg(1).compile().is_err());
        assert!(Template::new("a = 1").arg(1).compile().is_err());
    }

    #[test]
    fn placeholder_in_template_text_is_rejected() {
        let err = Template::new("SELECT * FROM kv WHERE key = ? AND value = {}")
            .arg("x")
            .compile()
            .unwrap_err();
        assert_eq!(err.position, Some(0));

        let err = Template::new("a = {} AND b = :b AND c = {}")
            .arg(1)
            .arg(2)
            .compile()
            .unwrap_err();
        assert_eq!(err.position, Some(1));

        assert!(Template::new("a = {} AND b = $2").arg(1).compile().is_err());
        let frag = Template::new("SELECT '?', {} -- ?")
            .arg(1)
            .compile()
            .expect("quoted and commented markers are text");
        assert_eq!(frag.text(), "SELECT '?', ?1 -- ?");
    }

    #[test]
    fn digit_after_marker_stays_separate() {
        let frag = Template::new("SELECT {}0").arg(1).compile().expect("compiles");
        assert_eq!(frag.text(), "SELECT ?1 0");
        assert_eq!(frag.placeholder_count(), frag.params().len());
    }

    #[test]
    fn none_binds_null() {
        let frag = Template::new("v = {}")
            .arg(Option::<i64>::None)
            .compile()
            .expect("compiles");
        assert_eq!(frag.params(), &[RowValues::Null]);
    }
}
