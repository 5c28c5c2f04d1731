use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use super::store::Store;
use crate::error::{Error, Result};

/// A model persisted as one row of a named table.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: &'static str;

    fn id(&self) -> i64;
}

/// Typed view over one table of a [`Store`].
pub struct Table<T> {
    store: Arc<dyn Store>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

/// Builds a partial row for [`Table::update`].
pub fn fields<'a>(pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn to_row<T: Serialize>(record: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::Internal("record did not serialize to an object".into())),
    }
}

impl<T: Record> Table<T> {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn insert(&self, record: &T) -> Result<T> {
        let row = to_row(record)?;
        let data = self.store.insert_row(T::TABLE, row).await.into_data()?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn update(&self, id: i64, fields: Map<String, Value>) -> Result<T> {
        let data = self
            .store
            .update_row(T::TABLE, id, fields)
            .await
            .into_data()?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn save(&self, record: &T) -> Result<T> {
        let row = to_row(record)?;
        self.update(record.id(), row).await
    }

    pub async fn get(&self, id: i64) -> Result<T> {
        let data = self
            .store
            .get_rows_data(T::TABLE, Some("id"), Some(&Value::from(id)), false)
            .await
            .into_data()
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(format!("{} {} not found", T::TABLE, id)),
                other => other,
            })?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn find_by(&self, column: &str, value: Value) -> Result<Vec<T>> {
        let data = self
            .store
            .get_rows_data(T::TABLE, Some(column), Some(&value), true)
            .await
            .into_data()?;
        Ok(decode_rows(data))
    }

    pub async fn find_one_by(&self, column: &str, value: Value) -> Result<Option<T>> {
        Ok(self.find_by(column, value).await?.into_iter().next())
    }

    pub async fn all(&self) -> Result<Vec<T>> {
        let data = self
            .store
            .get_rows_data(T::TABLE, None, None, true)
            .await
            .into_data()?;
        Ok(decode_rows(data))
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.store.delete_row(T::TABLE, id).await.into_data()?;
        Ok(())
    }

    /// Conditional update. `Ok(None)` means another writer got there first.
    pub async fn claim(
        &self,
        id: i64,
        column: &str,
        expected: &Value,
        fields: Map<String, Value>,
    ) -> Result<Option<T>> {
        let envelope = self
            .store
            .compare_and_update(T::TABLE, id, column, expected, fields)
            .await;
        if envelope.status_code == 409 {
            return Ok(None);
        }
        let data = envelope.into_data()?;
        Ok(Some(serde_json::from_value(data)?))
    }
}

/// Rows that no longer match the model are skipped rather than failing the
/// whole listing.
fn decode_rows<T: DeserializeOwned>(data: Value) -> Vec<T> {
    let Value::Array(rows) = data else {
        return Vec::new();
    };
    rows.into_iter()
        .filter_map(|row| {
            let id = row.get("id").cloned();
            match serde_json::from_value(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(?id, error = %e, "skipping undecodable row");
                    None
                }
            }
        })
        .collect()
}
