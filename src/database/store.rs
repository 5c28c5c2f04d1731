//! Persistence contract shared by every component.
//!
//! Rows are JSON objects keyed by an integer `id` assigned by the store. Each
//! operation answers with an [`Envelope`] so callers can inspect status codes
//! without matching on backend specific errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    pub status_code: u16,
    pub message: String,
    pub data: Value,
}

impl Envelope {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            status_code: 200,
            message: "ok".to_string(),
            data,
        }
    }

    pub fn created(data: Value) -> Self {
        Self {
            ok: true,
            status_code: 201,
            message: "created".to_string(),
            data,
        }
    }

    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status_code,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::error(404, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::error(409, message)
    }

    pub fn into_data(self) -> Result<Value> {
        if self.ok {
            return Ok(self.data);
        }
        Err(match self.status_code {
            400 | 409 | 422 => Error::BadRequest(self.message),
            404 => Error::NotFound(self.message),
            _ => Error::Internal(self.message),
        })
    }
}

/// Column hints used when a table is created. Backends may index them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<String>,
    pub indexed: Vec<String>,
}

impl TableSchema {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            indexed: Vec::new(),
        }
    }

    pub fn with_index(mut self, column: &str) -> Self {
        self.indexed.push(column.to_string());
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn table_exists(&self, table: &str) -> bool;

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Envelope;

    /// Inserts `row` and returns it with the assigned `id`.
    async fn insert_row(&self, table: &str, row: Map<String, Value>) -> Envelope;

    /// Merges `fields` into the row and returns the updated row.
    async fn update_row(&self, table: &str, id: i64, fields: Map<String, Value>) -> Envelope;

    async fn delete_row(&self, table: &str, id: i64) -> Envelope;

    /// Without a column every row matches. With `multiple == false` the first
    /// match is returned as an object, or 404 when nothing matched.
    async fn get_rows_data(
        &self,
        table: &str,
        column: Option<&str>,
        value: Option<&Value>,
        multiple: bool,
    ) -> Envelope;

    /// Applies `fields` only while `column` still equals `expected`. Answers 409
    /// when the comparison fails so two writers can never both win.
    async fn compare_and_update(
        &self,
        table: &str,
        id: i64,
        column: &str,
        expected: &Value,
        fields: Map<String, Value>,
    ) -> Envelope;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_errors_map_to_taxonomy() {
        assert!(matches!(
            Envelope::not_found("missing").into_data(),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            Envelope::conflict("taken").into_data(),
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            Envelope::error(500, "boom").into_data(),
            Err(Error::Internal(_))
        ));
        assert_eq!(
            Envelope::ok(Value::Bool(true)).into_data().unwrap(),
            Value::Bool(true)
        );
    }
}
