use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::database::table::Record;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    #[serde(default)]
    pub id: i64,
    pub key: String,
    pub value: JsonValue,
    pub updated_at: DateTime<Utc>,
}

impl Record for Setting {
    const TABLE: &'static str = "settings";

    fn id(&self) -> i64 {
        self.id
    }
}
