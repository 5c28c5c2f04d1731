//! Postgres backed [`Store`]. Each logical table is a real table holding the
//! row document in a JSONB column.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};

use super::store::{Envelope, Store, TableSchema};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63
}

fn row_to_value(row: &sqlx::postgres::PgRow) -> Result<Value, sqlx::Error> {
    let id: i64 = row.try_get("id")?;
    let data: Value = row.try_get("data")?;
    let mut object = match data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    object.insert("id".to_string(), Value::from(id));
    Ok(Value::Object(object))
}

fn db_error(context: &str, err: sqlx::Error) -> Envelope {
    tracing::error!(error = %err, context, "store query failed");
    Envelope::error(500, format!("{} failed", context))
}

macro_rules! checked_table {
    ($table:expr) => {
        if !is_identifier($table) {
            return Envelope::error(400, format!("invalid table name: {}", $table));
        }
    };
}

#[async_trait]
impl Store for PgStore {
    async fn table_exists(&self, table: &str) -> bool {
        if !is_identifier(table) {
            return false;
        }
        sqlx::query_scalar::<_, bool>(
            r#"SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            )"#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .unwrap_or(false)
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Envelope {
        checked_table!(table);
        let ddl = format!(
            r#"CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                data JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#
        );
        if let Err(e) = sqlx::query(&ddl).execute(&self.pool).await {
            return db_error("create_table", e);
        }
        for column in schema.indexed.iter().filter(|c| is_identifier(c)) {
            let index = format!(
                "CREATE INDEX IF NOT EXISTS {table}_{column}_idx ON {table} ((data->>'{column}'))"
            );
            if let Err(e) = sqlx::query(&index).execute(&self.pool).await {
                return db_error("create_index", e);
            }
        }
        Envelope::created(Value::String(table.to_string()))
    }

    async fn insert_row(&self, table: &str, mut row: Map<String, Value>) -> Envelope {
        checked_table!(table);
        row.remove("id");
        let sql = format!("INSERT INTO {table} (data) VALUES ($1) RETURNING id, data");
        match sqlx::query(&sql)
            .bind(Value::Object(row))
            .fetch_one(&self.pool)
            .await
            .and_then(|r| row_to_value(&r))
        {
            Ok(value) => Envelope::created(value),
            Err(e) => db_error("insert_row", e),
        }
    }

    async fn update_row(&self, table: &str, id: i64, mut fields: Map<String, Value>) -> Envelope {
        checked_table!(table);
        fields.remove("id");
        let sql = format!("UPDATE {table} SET data = data || $2 WHERE id = $1 RETURNING id, data");
        match sqlx::query(&sql)
            .bind(id)
            .bind(Value::Object(fields))
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(row)) => match row_to_value(&row) {
                Ok(value) => Envelope::ok(value),
                Err(e) => db_error("update_row", e),
            },
            Ok(None) => Envelope::not_found(format!("row {} not found in {}", id, table)),
            Err(e) => db_error("update_row", e),
        }
    }

    async fn delete_row(&self, table: &str, id: i64) -> Envelope {
        checked_table!(table);
        let sql = format!("DELETE FROM {table} WHERE id = $1");
        match sqlx::query(&sql).bind(id).execute(&self.pool).await {
            Ok(done) if done.rows_affected() > 0 => Envelope::ok(Value::from(id)),
            Ok(_) => Envelope::not_found(format!("row {} not found in {}", id, table)),
            Err(e) => db_error("delete_row", e),
        }
    }

    async fn get_rows_data(
        &self,
        table: &str,
        column: Option<&str>,
        value: Option<&Value>,
        multiple: bool,
    ) -> Envelope {
        checked_table!(table);
        let limit = if multiple { "" } else { " LIMIT 1" };
        let result = match (column, value) {
            (Some("id"), Some(expected)) => {
                let sql = format!("SELECT id, data FROM {table} WHERE id = $1 ORDER BY id{limit}");
                sqlx::query(&sql)
                    .bind(expected.as_i64().unwrap_or(-1))
                    .fetch_all(&self.pool)
                    .await
            }
            (Some(col), Some(expected)) => {
                let sql = format!(
                    "SELECT id, data FROM {table} WHERE COALESCE(data -> $1, 'null'::jsonb) = $2 ORDER BY id{limit}"
                );
                sqlx::query(&sql)
                    .bind(col)
                    .bind(expected.clone())
                    .fetch_all(&self.pool)
                    .await
            }
            _ => {
                let sql = format!("SELECT id, data FROM {table} ORDER BY id{limit}");
                sqlx::query(&sql).fetch_all(&self.pool).await
            }
        };

        let rows = match result {
            Ok(rows) => rows,
            Err(e) => return db_error("get_rows_data", e),
        };
        let values: Result<Vec<Value>, _> = rows.iter().map(row_to_value).collect();
        match values {
            Ok(values) if multiple => Envelope::ok(Value::Array(values)),
            Ok(mut values) => match values.pop() {
                Some(value) => Envelope::ok(value),
                None => Envelope::not_found(format!("no matching row in {}", table)),
            },
            Err(e) => db_error("get_rows_data", e),
        }
    }

    async fn compare_and_update(
        &self,
        table: &str,
        id: i64,
        column: &str,
        expected: &Value,
        mut fields: Map<String, Value>,
    ) -> Envelope {
        checked_table!(table);
        fields.remove("id");
        let sql = format!(
            r#"UPDATE {table} SET data = data || $2
               WHERE id = $1 AND COALESCE(data -> $3, 'null'::jsonb) = $4
               RETURNING id, data"#
        );
        match sqlx::query(&sql)
            .bind(id)
            .bind(Value::Object(fields))
            .bind(column)
            .bind(expected.clone())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(row)) => match row_to_value(&row) {
                Ok(value) => Envelope::ok(value),
                Err(e) => db_error("compare_and_update", e),
            },
            Ok(None) => Envelope::conflict(format!("{} changed concurrently", column)),
            Err(e) => db_error("compare_and_update", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::is_identifier;

    #[test]
    fn identifiers_are_restricted() {
        assert!(is_identifier("webhook_logs"));
        assert!(is_identifier("_t1"));
        assert!(!is_identifier("1table"));
        assert!(!is_identifier("logs; DROP TABLE x"));
        assert!(!is_identifier("Logs"));
        assert!(!is_identifier(""));
    }
}
