use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::types::RowValues;

/// One result row.
///
/// Column names are shared with the owning [`ResultSet`](super::ResultSet), so rows are
/// cheap to clone and compare.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomDbRow {
    pub column_names: Arc<Vec<String>>,
    /// Cell values, in column order.
    pub rows: Vec<RowValues>,
}

impl CustomDbRow {
    #[must_use]
    pub fn new(column_names: Arc<Vec<String>>, rows: Vec<RowValues>) -> Self {
        Self { column_names, rows }
    }

    #[must_use]
    pub fn get_column_index(&self, column_name: &str) -> Option<usize> {
        self.column_names.iter().position(|col| col == column_name)
    }

    /// Value of the named column; `None` for an unknown column.
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&RowValues> {
        self.get_column_index(column_name)
            .and_then(|idx| self.rows.get(idx))
    }

    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&RowValues> {
        self.rows.get(index)
    }

    /// Render the row as a JSON object keyed by column name.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        let mut object = Map::with_capacity(self.rows.len());
        for (name, value) in self.column_names.iter().zip(&self.rows) {
            let json = serde_json::to_value(value).unwrap_or(JsonValue::Null);
            object.insert(name.clone(), json);
        }
        JsonValue::Object(object)
    }
}
