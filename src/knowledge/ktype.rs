//! Knowledge types and the per-session registry of them

use super::timestamp;
use super::webform::Webform;
use crate::error::{DsmsError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

const MAX_ID_LEN: usize = 50;
const MAX_NAME_LEN: usize = 50;

/// Schema of a family of knowledge items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KType {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webform: Option<Webform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
    #[serde(default, skip_serializing, deserialize_with = "timestamp::deserialize")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing, deserialize_with = "timestamp::deserialize")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl KType {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            webform: None,
            json_schema: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_webform(mut self, webform: Webform) -> Self {
        self.webform = Some(webform);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DsmsError::validation("ktype.id", "must not be empty"));
        }
        if self.id.chars().count() > MAX_ID_LEN {
            return Err(DsmsError::validation(
                "ktype.id",
                format!("must be at most {} characters", MAX_ID_LEN),
            ));
        }
        if let Some(name) = &self.name {
            if name.chars().count() > MAX_NAME_LEN {
                return Err(DsmsError::validation(
                    "ktype.name",
                    format!("must be at most {} characters", MAX_NAME_LEN),
                ));
            }
        }
        Ok(())
    }

    pub fn from_wire(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Body for create and update requests
    pub fn to_wire(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Immutable snapshot of the knowledge types known to a session
///
/// A refresh builds a new registry; handles taken from an older one stay valid.
#[derive(Debug, Clone, Default)]
pub struct KTypeRegistry {
    types: Arc<BTreeMap<String, Arc<KType>>>,
}

impl KTypeRegistry {
    pub fn new(types: impl IntoIterator<Item = KType>) -> Self {
        Self {
            types: Arc::new(
                types
                    .into_iter()
                    .map(|ktype| (ktype.id.clone(), Arc::new(ktype)))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<KType>> {
        self.types.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.types.contains_key(id)
    }

    /// Webform of `id`, shared for binding into items
    pub fn webform(&self, id: &str) -> Option<Arc<Webform>> {
        self.types
            .get(id)
            .and_then(|ktype| ktype.webform.clone())
            .map(Arc::new)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<KType>> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_length_is_limited() {
        assert!(KType::new("specimen").validate().is_ok());
        assert!(KType::new("x".repeat(51)).validate().is_err());
        assert!(KType::new("").validate().is_err());
    }

    #[test]
    fn wire_round_trip_drops_timestamps() {
        let ktype = KType::from_wire(&json!({
            "id": "specimen",
            "name": "Specimen",
            "webform": { "sections": [] },
            "created_at": "2024-01-01T00:00:00",
            "updated_at": "2024-01-02T00:00:00+00:00"
        }))
        .unwrap();
        assert!(ktype.created_at.unwrap() < ktype.updated_at.unwrap());

        let wire = ktype.to_wire().unwrap();
        assert_eq!(wire["id"], "specimen");
        assert!(wire.get("created_at").is_none());
    }

    #[test]
    fn registry_snapshot_is_independent_of_refresh() {
        let old = KTypeRegistry::new(vec![KType::new("a")]);
        let handle = old.get("a").unwrap();
        let new = KTypeRegistry::new(vec![KType::new("b")]);

        assert_eq!(handle.id, "a");
        assert!(old.contains("a"));
        assert!(!new.contains("a"));
        assert_eq!(new.ids().collect::<Vec<_>>(), vec!["b"]);
    }
}
