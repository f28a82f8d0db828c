//! Parameterized SQL fragments and the `{}` template compiler.
//!
//! A [`SqlFragment`] keeps literal text segments and parameters apart, so composing
//! fragments never concatenates user values into SQL and placeholders are renumbered
//! for free when the text is rendered.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::CompilationError;
use crate::types::{QueryAndParams, RowValues};

mod parsers;
pub(crate) mod scanner;
mod template;

pub use template::{SqlArg, Template};

use scanner::{TokenKind, tokenize};

static MODIFY_QUERY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(insert\s+(or\s+\w+\s+)?into|replace\s+into|delete\s+from|update\s+(or\s+\w+\s+)?)")
        .expect("modify-query pattern is valid")
});

/// Compiled SQL text plus its positional parameters.
///
/// Invariant: `segments.len() == params.len() + 1`; [`SqlFragment::text`] emits one
/// numbered placeholder between each pair of segments.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    segments: Vec<String>,
    params: Vec<RowValues>,
}

impl Default for SqlFragment {
    fn default() -> Self {
        Self::empty()
    }
}

impl SqlFragment {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            segments: vec![String::new()],
            params: Vec::new(),
        }
    }

    /// Trusted SQL text with no parameters (keywords, identifiers, expressions).
    ///
    /// Use [`SqlFragment::new`] for hand-written SQL that binds values.
    ///
    /// # Errors
    /// Returns [`CompilationError`] when the text contains a placeholder outside
    /// literals and comments.
    pub fn raw(text: impl Into<String>) -> Result<Self, CompilationError> {
        let text = text.into();
        reject_placeholders(&text, 0)?;
        Ok(Self::verbatim(text))
    }

    /// Unchecked literal text; callers guarantee it holds no placeholders.
    pub(crate) fn verbatim(text: impl Into<String>) -> Self {
        Self {
            segments: vec![text.into()],
            params: Vec::new(),
        }
    }

    /// A single bound value.
    #[must_use]
    pub fn param(value: impl Into<RowValues>) -> Self {
        Self {
            segments: vec![String::new(), String::new()],
            params: vec![value.into()],
        }
    }

    /// A double-quoted identifier; dotted names are quoted per segment.
    #[must_use]
    pub fn ident(name: &str) -> Self {
        let quoted = name
            .split('.')
            .map(|part| format!("\"{}\"", part.replace('"', "")))
            .collect::<Vec<_>>()
            .join(".");
        Self::verbatim(quoted)
    }

    /// Hand-written SQL using `?` or `?NNN` placeholders plus its parameters.
    ///
    /// # Errors
    /// Returns [`CompilationError`] when the placeholder count does not match `params`,
    /// when named placeholders are used, or when ordinals are not `1..=n` in order.
    pub fn new(text: &str, params: Vec<RowValues>) -> Result<Self, CompilationError> {
        let mut segments = Vec::with_capacity(params.len() + 1);
        let mut cursor = 0;
        let mut seen = 0;

        for token in tokenize(text) {
            if token.kind != TokenKind::Placeholder {
                continue;
            }
            match token.ordinal() {
                None => {
                    return Err(CompilationError::at(
                        seen,
                        format!("named placeholder '{}' is not supported", token.text),
                    ));
                }
                Some(Some(ordinal)) if ordinal != seen + 1 => {
                    return Err(CompilationError::at(
                        seen,
                        format!("placeholder '?{ordinal}' is out of order"),
                    ));
                }
                Some(_) => {}
            }
            segments.push(text[cursor..token.start].to_string());
            cursor = token.end;
            seen += 1;
        }
        segments.push(text[cursor..].to_string());

        if seen != params.len() {
            return Err(CompilationError::general(format!(
                "query has {seen} placeholders but {} parameters were supplied",
                params.len()
            )));
        }
        Ok(Self { segments, params })
    }

    /// Join fragments with a separator, skipping empty ones.
    ///
    /// # Errors
    /// Returns [`CompilationError`] when nothing is left to join or the separator
    /// contains a placeholder.
    pub fn join<I>(items: I, separator: &str) -> Result<Self, CompilationError>
    where
        I: IntoIterator<Item = SqlFragment>,
    {
        reject_placeholders(separator, 0)?;
        let mut out: Option<SqlFragment> = None;
        for item in items.into_iter().filter(|f| !f.is_empty()) {
            match out.as_mut() {
                Some(acc) => {
                    acc.push_str(separator);
                    acc.append(item);
                }
                None => out = Some(item),
            }
        }
        out.ok_or_else(|| CompilationError::general("join() called with no non-empty fragments"))
    }

    /// Render the text with numbered placeholders `?1 … ?n`.
    ///
    /// A segment starting with a digit is set off by a space so it cannot extend the
    /// preceding ordinal.
    #[must_use]
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(
            self.segments.iter().map(String::len).sum::<usize>() + self.params.len() * 4,
        );
        text.push_str(&self.segments[0]);
        for (i, segment) in self.segments[1..].iter().enumerate() {
            text.push('?');
            text.push_str(&(i + 1).to_string());
            if segment.starts_with(|c: char| c.is_ascii_digit()) {
                text.push(' ');
            }
            text.push_str(segment);
        }
        text
    }

    #[must_use]
    pub fn params(&self) -> &[RowValues] {
        &self.params
    }

    #[must_use]
    pub fn placeholder_count(&self) -> usize {
        self.segments.len() - 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.segments.iter().all(|s| s.trim().is_empty())
    }

    /// Cheap textual check for INSERT/REPLACE/UPDATE/DELETE.
    ///
    /// May report false positives (keywords inside literals); the dependency tracker
    /// does the precise analysis.
    #[must_use]
    pub fn is_modify_query(&self) -> bool {
        self.segments.iter().any(|s| MODIFY_QUERY.is_match(s))
    }

    /// Append literal text; callers guarantee it holds no placeholders.
    pub(crate) fn push_str(&mut self, text: &str) {
        if let Some(last) = self.segments.last_mut() {
            last.push_str(text);
        }
    }

    /// Append one bound value.
    pub fn push_param(&mut self, value: impl Into<RowValues>) {
        self.params.push(value.into());
        self.segments.push(String::new());
    }

    /// Splice another fragment in place; its parameters follow the current ones.
    pub fn append(&mut self, other: SqlFragment) {
        let mut segments = other.segments.into_iter();
        if let Some(first) = segments.next() {
            self.push_str(&first);
        }
        self.segments.extend(segments);
        self.params.extend(other.params);
    }

    #[must_use]
    pub fn appended(mut self, other: SqlFragment) -> Self {
        self.append(other);
        self
    }

    /// Rendered text and owned params, as handed to drivers.
    #[must_use]
    pub fn to_query(&self) -> QueryAndParams {
        QueryAndParams::new(self.text(), self.params.clone())
    }

    /// Debug rendering with parameters inlined as literals. Never execute this.
    #[must_use]
    pub fn raw_preview(&self) -> String {
        let mut text = self.segments[0].clone();
        for (value, segment) in self.params.iter().zip(&self.segments[1..]) {
            text.push_str(&value.preview());
            text.push_str(segment);
        }
        text
    }
}

impl fmt::Display for SqlFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {:?}", self.text(), self.params)
    }
}

/// Fails on the first placeholder token in literal SQL text. `position` is the
/// interpolation index reported for it.
pub(crate) fn reject_placeholders(text: &str, position: usize) -> Result<(), CompilationError> {
    match tokenize(text).into_iter().find(|t| t.kind == TokenKind::Placeholder) {
        Some(token) => Err(CompilationError::at(
            position,
            format!(
                "placeholder '{}' in literal SQL text; bind values with {{}} or SqlFragment::new",
                token.text
            ),
        )),
        None => Ok(()),
    }
}

/// Anything that compiles to a [`SqlFragment`].
pub trait Compile {
    /// # Errors
    /// Returns [`CompilationError`] for malformed builder or template input.
    fn compile(&self) -> Result<SqlFragment, CompilationError>;
}

impl Compile for SqlFragment {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        Ok(self.clone())
    }
}

impl<T: Compile + ?Sized> Compile for &T {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        (**self).compile()
    }
}

/// Lets `sql!` output go straight to `run_query`; the error surfaces there.
impl Compile for Result<SqlFragment, CompilationError> {
    fn compile(&self) -> Result<SqlFragment, CompilationError> {
        self.clone()
    }
}

/// Build a [`SqlFragment`] from a `{}` template and arguments.
///
/// Scalars become bound parameters; fragments and builder nodes are spliced in place.
/// ```rust
/// use sql_reactive::prelude::*;
/// use sql_reactive::sql;
///
/// # fn demo() -> Result<(), CompilationError> {
/// let filter = sql!("key = {}", "a")?;
/// let query = sql!("SELECT * FROM kv WHERE {} AND value <> {}", filter, "b")?;
/// assert_eq!(query.text(), "SELECT * FROM kv WHERE key = ?1 AND value <> ?2");
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! sql {
    ($text:literal $(, $arg:expr)* $(,)?) => {
        $crate::sql::Template::new($text)$(.arg($arg))*.compile()
    };
}
