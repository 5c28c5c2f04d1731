use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::store::{Envelope, Store, TableSchema};

#[derive(Debug, Default)]
struct MemTable {
    schema: TableSchema,
    next_id: i64,
    rows: BTreeMap<i64, Map<String, Value>>,
}

/// Process-local store. Used by tests and when no `DATABASE_URL` is set.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, MemTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn schema(&self, table: &str) -> Option<TableSchema> {
        self.tables.read().await.get(table).map(|t| t.schema.clone())
    }
}

fn row_value(id: i64, row: &Map<String, Value>) -> Value {
    let mut out = row.clone();
    out.insert("id".to_string(), Value::from(id));
    Value::Object(out)
}

#[async_trait]
impl Store for MemoryStore {
    async fn table_exists(&self, table: &str) -> bool {
        self.tables.read().await.contains_key(table)
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Envelope {
        let mut tables = self.tables.write().await;
        tables.entry(table.to_string()).or_insert_with(|| MemTable {
            schema: schema.clone(),
            next_id: 1,
            rows: BTreeMap::new(),
        });
        Envelope::created(Value::String(table.to_string()))
    }

    async fn insert_row(&self, table: &str, mut row: Map<String, Value>) -> Envelope {
        let mut tables = self.tables.write().await;
        let Some(mem) = tables.get_mut(table) else {
            return Envelope::not_found(format!("table {} does not exist", table));
        };
        let id = mem.next_id;
        mem.next_id += 1;
        row.remove("id");
        let value = row_value(id, &row);
        mem.rows.insert(id, row);
        Envelope::created(value)
    }

    async fn update_row(&self, table: &str, id: i64, fields: Map<String, Value>) -> Envelope {
        let mut tables = self.tables.write().await;
        let Some(mem) = tables.get_mut(table) else {
            return Envelope::not_found(format!("table {} does not exist", table));
        };
        let Some(row) = mem.rows.get_mut(&id) else {
            return Envelope::not_found(format!("row {} not found in {}", id, table));
        };
        for (key, value) in fields {
            if key != "id" {
                row.insert(key, value);
            }
        }
        Envelope::ok(row_value(id, row))
    }

    async fn delete_row(&self, table: &str, id: i64) -> Envelope {
        let mut tables = self.tables.write().await;
        let Some(mem) = tables.get_mut(table) else {
            return Envelope::not_found(format!("table {} does not exist", table));
        };
        match mem.rows.remove(&id) {
            Some(_) => Envelope::ok(Value::from(id)),
            None => Envelope::not_found(format!("row {} not found in {}", id, table)),
        }
    }

    async fn get_rows_data(
        &self,
        table: &str,
        column: Option<&str>,
        value: Option<&Value>,
        multiple: bool,
    ) -> Envelope {
        let tables = self.tables.read().await;
        let Some(mem) = tables.get(table) else {
            return Envelope::not_found(format!("table {} does not exist", table));
        };

        let matches = mem.rows.iter().filter(|(id, row)| match (column, value) {
            (Some("id"), Some(expected)) => expected.as_i64() == Some(**id),
            (Some(col), Some(expected)) => row.get(col).unwrap_or(&Value::Null) == expected,
            _ => true,
        });

        if multiple {
            let rows: Vec<Value> = matches.map(|(id, row)| row_value(*id, row)).collect();
            return Envelope::ok(Value::Array(rows));
        }

        match matches.map(|(id, row)| row_value(*id, row)).next() {
            Some(row) => Envelope::ok(row),
            None => Envelope::not_found(format!("no matching row in {}", table)),
        }
    }

    async fn compare_and_update(
        &self,
        table: &str,
        id: i64,
        column: &str,
        expected: &Value,
        fields: Map<String, Value>,
    ) -> Envelope {
        let mut tables = self.tables.write().await;
        let Some(mem) = tables.get_mut(table) else {
            return Envelope::not_found(format!("table {} does not exist", table));
        };
        let Some(row) = mem.rows.get_mut(&id) else {
            return Envelope::not_found(format!("row {} not found in {}", id, table));
        };
        if row.get(column).unwrap_or(&Value::Null) != expected {
            return Envelope::conflict(format!("{} changed concurrently", column));
        }
        for (key, value) in fields {
            if key != "id" {
                row.insert(key, value);
            }
        }
        Envelope::ok(row_value(id, row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn insert_requires_existing_table() {
        let store = MemoryStore::new();
        let env = store.insert_row("missing", obj(json!({"a": 1}))).await;
        assert!(!env.ok);
        assert_eq!(env.status_code, 404);
    }

    #[tokio::test]
    async fn rows_get_sequential_ids_and_can_be_filtered() {
        let store = MemoryStore::new();
        store.create_table("items", &TableSchema::new(&["kind"])).await;
        store.insert_row("items", obj(json!({"kind": "a"}))).await;
        let second = store.insert_row("items", obj(json!({"kind": "b"}))).await;
        assert_eq!(second.data["id"], 2);

        let found = store
            .get_rows_data("items", Some("kind"), Some(&json!("b")), false)
            .await;
        assert_eq!(found.data["id"], 2);

        let all = store.get_rows_data("items", None, None, true).await;
        assert_eq!(all.data.as_array().map(Vec::len), Some(2));

        let none = store
            .get_rows_data("items", Some("kind"), Some(&json!("z")), false)
            .await;
        assert_eq!(none.status_code, 404);
    }

    #[tokio::test]
    async fn compare_and_update_only_applies_once() {
        let store = MemoryStore::new();
        store.create_table("tasks", &TableSchema::default()).await;
        store
            .insert_row("tasks", obj(json!({"claim_token": null})))
            .await;

        let first = store
            .compare_and_update(
                "tasks",
                1,
                "claim_token",
                &Value::Null,
                obj(json!({"claim_token": "a"})),
            )
            .await;
        let second = store
            .compare_and_update(
                "tasks",
                1,
                "claim_token",
                &Value::Null,
                obj(json!({"claim_token": "b"})),
            )
            .await;

        assert!(first.ok);
        assert_eq!(second.status_code, 409);
        let row = store
            .get_rows_data("tasks", Some("id"), Some(&json!(1)), false)
            .await;
        assert_eq!(row.data["claim_token"], "a");
    }
}
