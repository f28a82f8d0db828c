use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::row::CustomDbRow;
use crate::types::RowValues;

/// Rows and affected-row count returned by one statement.
///
/// Reads carry rows; writes carry `rows_affected` and no columns. Equality is
/// structural, which is what live queries use to decide whether anything changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub results: Vec<CustomDbRow>,
    /// Changed rows for DML; row count for reads.
    pub rows_affected: usize,
    column_names: Option<Arc<Vec<String>>>,
}

impl ResultSet {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> ResultSet {
        ResultSet {
            results: Vec::with_capacity(capacity),
            rows_affected: 0,
            column_names: None,
        }
    }

    /// Result of a statement that returned no rows.
    #[must_use]
    pub fn affected(rows_affected: usize) -> ResultSet {
        ResultSet {
            results: Vec::new(),
            rows_affected,
            column_names: None,
        }
    }

    /// Must be called before rows are added.
    pub fn set_column_names(&mut self, column_names: Arc<Vec<String>>) {
        self.column_names = Some(column_names);
    }

    #[must_use]
    pub fn get_column_names(&self) -> Option<&Arc<Vec<String>>> {
        self.column_names.as_ref()
    }

    /// Rows added before column names are set are dropped.
    pub fn add_row_values(&mut self, row_values: Vec<RowValues>) {
        if let Some(column_names) = &self.column_names {
            self.results
                .push(CustomDbRow::new(Arc::clone(column_names), row_values));
            self.rows_affected += 1;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Render all rows as a JSON array of objects.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(self.results.iter().map(CustomDbRow::to_json).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(rows: &[(&str, &str)]) -> ResultSet {
        let mut rs = ResultSet::with_capacity(rows.len());
        rs.set_column_names(Arc::new(vec!["key".into(), "value".into()]));
        for (k, v) in rows {
            rs.add_row_values(vec![RowValues::from(*k), RowValues::from(*v)]);
        }
        rs
    }

    #[test]
    fn equality_is_structural() {
        assert_eq!(kv(&[("a", "b")]), kv(&[("a", "b")]));
        assert_ne!(kv(&[("a", "b")]), kv(&[("a", "c")]));
        assert_ne!(kv(&[]), ResultSet::affected(0));
    }

    #[test]
    fn rows_render_as_json_objects() {
        let rs = kv(&[("a", "b")]);
        assert_eq!(rs.to_json(), serde_json::json!([{ "key": "a", "value": "b" }]));
        assert_eq!(rs.results[0].get("value"), Some(&RowValues::Text("b".into())));
    }
}
