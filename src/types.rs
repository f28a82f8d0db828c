use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single SQL value: fragment parameter, driver parameter and result cell alike.
///
/// ```rust
/// use sql_reactive::prelude::*;
///
/// let id = RowValues::from(7);
/// assert_eq!(id.as_int(), Some(7));
/// assert_eq!(RowValues::Text("1".into()).as_bool(), None);
/// assert!(RowValues::from(None::<i64>).is_null());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowValues {
    Int(i64),
    Float(f64),
    Text(String),
    /// Stored as 0/1 by engines without a boolean type.
    Bool(bool),
    Timestamp(NaiveDateTime),
    Null,
    JSON(JsonValue),
    Blob(Vec<u8>),
}

/// Text layouts accepted when reading a timestamp back from a TEXT column.
const TIMESTAMP_LAYOUTS: [&str; 2] = ["%F %T%.f", "%FT%T%.f"];

impl RowValues {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Booleans, plus the integers 0 and 1.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Int(0) => Some(false),
            Self::Int(1) => Some(true),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Timestamp(value) => Some(*value),
            Self::Text(text) => TIMESTAMP_LAYOUTS
                .iter()
                .find_map(|layout| NaiveDateTime::parse_from_str(text, layout).ok()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Literal rendering used by debug previews; not an escaping routine for execution.
    pub(crate) fn preview(&self) -> String {
        match self {
            RowValues::Int(i) => i.to_string(),
            RowValues::Float(f) => f.to_string(),
            RowValues::Text(s) => format!("'{}'", s.replace('\'', "''")),
            RowValues::Bool(b) => i64::from(*b).to_string(),
            RowValues::Timestamp(dt) => format!("'{}'", dt.format("%F %T%.f")),
            RowValues::Null => "NULL".to_string(),
            RowValues::JSON(value) => format!("'{value}'"),
            RowValues::Blob(bytes) => format!("<blob {} bytes>", bytes.len()),
        }
    }
}

macro_rules! row_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for RowValues {
                fn from(value: $ty) -> Self {
                    RowValues::$variant(value.into())
                }
            }
        )*
    };
}

row_value_from! {
    i64 => Int,
    i32 => Int,
    u32 => Int,
    i16 => Int,
    u8 => Int,
    f64 => Float,
    f32 => Float,
    String => Text,
    &str => Text,
    &String => Text,
    bool => Bool,
    NaiveDateTime => Timestamp,
    JsonValue => JSON,
    Vec<u8> => Blob,
    &[u8] => Blob,
}

impl<T: Into<RowValues>> From<Option<T>> for RowValues {
    fn from(value: Option<T>) -> Self {
        value.map_or(RowValues::Null, Into::into)
    }
}

/// Rendered SQL text and the parameters bound to its `?NNN` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAndParams {
    pub query: String,
    pub params: Vec<RowValues>,
}

impl QueryAndParams {
    pub fn new(query: impl Into<String>, params: Vec<RowValues>) -> Self {
        Self {
            query: query.into(),
            params,
        }
    }

    pub fn new_without_params(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
        }
    }
}

/// How a transaction acquires its locks when it begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionBehavior {
    /// Locks are acquired lazily on first read/write.
    #[default]
    Deferred,
    /// A write lock is taken immediately.
    Immediate,
    /// An exclusive lock is taken immediately.
    Exclusive,
}

impl TransactionBehavior {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            TransactionBehavior::Deferred => "BEGIN DEFERRED TRANSACTION",
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE TRANSACTION",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE TRANSACTION",
        }
    }
}
