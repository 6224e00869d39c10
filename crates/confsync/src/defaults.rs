//! Default table derived from a compiled schema.

use serde_json::Value;

use confsync_protocol::SettingsMap;

use crate::schema::Schema;

/// Key -> schema default. Built once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultTable {
    values: SettingsMap,
}

impl DefaultTable {
    pub fn from_schema(schema: &Schema) -> Self {
        let values = schema
            .fields()
            .map(|(key, field)| (key.to_string(), field.default.clone()))
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn as_map(&self) -> &SettingsMap {
        &self.values
    }

    pub fn to_map(&self) -> SettingsMap {
        self.values.clone()
    }
}
