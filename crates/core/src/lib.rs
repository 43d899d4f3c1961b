//! Cairn core types: entities, locations and the location update log.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Metadata shared by every entity kind.
///
/// `uid`, `etag` and `generation` are owned by the store; values coming from
/// a parsed descriptor are never persisted as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Canonical catalog item: envelope plus kind-specific `spec`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: EntityMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
}

impl Entity {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: EntityMeta { name: Some(name.into()), ..EntityMeta::default() },
            spec: None,
        }
    }

    /// Identity key, if the entity carries a name.
    pub fn entity_ref(&self) -> Option<EntityRef> {
        let name = self.metadata.name.clone()?;
        Some(EntityRef { namespace: self.metadata.namespace.clone(), name })
    }

    /// Drop the store-owned metadata fields.
    pub fn clear_store_fields(&mut self) {
        self.metadata.uid = None;
        self.metadata.etag = None;
        self.metadata.generation = None;
    }
}

/// Identity key of an entity: `(namespace, name)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub namespace: Option<String>,
    pub name: String,
}

impl EntityRef {
    /// Parse `name` or `namespace/name`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Some(Self { namespace: Some(ns.to_string()), name: name.to_string() })
            }
            None if !s.is_empty() => Some(Self { namespace: None, name: s.to_string() }),
            _ => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// External source of descriptor documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Success,
    Fail,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Success => "success",
            UpdateStatus::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(UpdateStatus::Success),
            "fail" => Some(UpdateStatus::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One row of the append-only location update log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateLogEvent {
    pub id: i64,
    pub location_id: String,
    pub status: UpdateStatus,
    pub component_name: Option<String>,
    pub message: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub mod prelude {
    pub use super::{Entity, EntityMeta, EntityRef, Location, UpdateLogEvent, UpdateStatus};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_roundtrips_camel_case_envelope() {
        let raw = serde_json::json!({
            "apiVersion": "backstage.io/v1alpha1",
            "kind": "Component",
            "metadata": { "name": "svc", "annotations": { "a": "1" } },
            "spec": { "type": "service" }
        });
        let e: Entity = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(e.metadata.name.as_deref(), Some("svc"));
        assert_eq!(e.metadata.annotations.get("a").map(String::as_str), Some("1"));
        assert!(e.metadata.labels.is_empty());
        assert_eq!(serde_json::to_value(&e).unwrap(), raw);
    }

    #[test]
    fn missing_metadata_defaults_to_empty() {
        let e: Entity = serde_json::from_str(r#"{"apiVersion":"v1","kind":"Component"}"#).unwrap();
        assert!(e.entity_ref().is_none());
    }

    #[test]
    fn entity_ref_parse_and_display() {
        let r = EntityRef::parse("prod/api").expect("ok");
        assert_eq!(r.namespace.as_deref(), Some("prod"));
        assert_eq!(r.name, "api");
        assert_eq!(r.to_string(), "prod/api");
        assert_eq!(EntityRef::parse("api").expect("ok").to_string(), "api");
        assert!(EntityRef::parse("").is_none());
        assert!(EntityRef::parse("/api").is_none());
        assert!(EntityRef::parse("a/b/c").is_none());
    }

    #[test]
    fn update_status_strings() {
        assert_eq!(UpdateStatus::Success.as_str(), "success");
        assert_eq!(UpdateStatus::parse("fail"), Some(UpdateStatus::Fail));
        assert_eq!(UpdateStatus::parse("FAIL"), None);
    }
}
