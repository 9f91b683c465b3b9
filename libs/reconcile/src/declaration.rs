//! The declaration record as stored by the control plane.
//!
//! Only the fields the reconciler reads or writes are typed. Everything else
//! (labels, annotations, status, managed fields) rides along in the flattened
//! `extra` maps so that writing a declaration back never drops data another
//! writer owns.

use bqtable_events::ObjectKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::StoreError;

/// A user-authored BigQueryTable declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Declaration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    pub metadata: ObjectMeta,

    /// Free-form desired state; see [`crate::spec::extract`].
    #[serde(default)]
    pub spec: Map<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    /// Opaque optimistic-concurrency token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Set once by the store when the user asks for removal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Declaration {
    /// Create an empty declaration (no spec, no finalizers).
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: None,
            kind: None,
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            spec: Map::new(),
            extra: Map::new(),
        }
    }

    /// Replace the spec with the given JSON object. Non-objects give an empty spec.
    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = match spec {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self
    }

    pub fn with_finalizer(mut self, token: &str) -> Self {
        self.metadata.finalizers = crate::finalizer::add(&self.metadata.finalizers, token);
        self
    }

    pub fn with_deletion_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.metadata.deletion_timestamp = Some(at);
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Whether the user has requested removal (tombstoned).
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, token: &str) -> bool {
        crate::finalizer::has(&self.metadata.finalizers, token)
    }

    /// Decode a declaration from a JSON value.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        serde_json::from_value(value).map_err(|e| StoreError::Malformed(e.to_string()))
    }

    /// Decode a declaration from raw bytes.
    pub fn from_slice(body: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(body).map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_stored_record() {
        let value = json!({
            "apiVersion": "mahdi.dev/v1",
            "kind": "BigQueryTable",
            "metadata": {
                "name": "orders",
                "namespace": "default",
                "resourceVersion": "812",
                "finalizers": ["bigquerytables.mahdi.dev/finalizer"],
                "deletionTimestamp": "2026-01-02T03:04:05Z",
                "labels": {"team": "sales"},
                "uid": "5b0c"
            },
            "spec": {"dataset": "sales"},
            "status": {"observed": true}
        });

        let decl = Declaration::from_value(value.clone()).unwrap();
        assert_eq!(decl.key(), ObjectKey::new("default", "orders"));
        assert_eq!(decl.metadata.resource_version.as_deref(), Some("812"));
        assert!(decl.is_deleting());
        assert!(decl.has_finalizer("bigquerytables.mahdi.dev/finalizer"));
        assert_eq!(decl.spec.get("dataset"), Some(&json!("sales")));

        // Foreign fields survive a write back.
        let written = serde_json::to_value(&decl).unwrap();
        assert_eq!(written, value);
    }

    #[test]
    fn test_empty_finalizers_omitted() {
        let decl = Declaration::new("default", "orders").with_spec(json!({"dataset": "d"}));
        let written = serde_json::to_value(&decl).unwrap();
        assert!(written["metadata"].get("finalizers").is_none());
        assert!(written["metadata"].get("deletionTimestamp").is_none());
    }

    #[test]
    fn test_malformed_record() {
        let err = Declaration::from_value(json!({"metadata": {"namespace": "x"}})).unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));

        let err = Declaration::from_slice(br#"{"metadata":{"name":"a"},"spec":[1,2]}"#).unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }
}
