//! Identity and notification types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Identity of a declaration: `(namespace, name)`.
///
/// Unique per resource kind. This is the unit of serialization for
/// reconciliation: two passes for the same key never run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = EventError;

    /// Parse `namespace/name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = s
            .split_once('/')
            .ok_or_else(|| EventError::InvalidPayload(format!("expected namespace/name, got '{s}'")))?;

        if namespace.is_empty() {
            return Err(EventError::MissingField("metadata.namespace"));
        }
        if name.is_empty() || name.contains('/') {
            return Err(EventError::MissingField("metadata.name"));
        }

        Ok(Self::new(namespace, name))
    }
}

/// Kind of change the control plane reported.
///
/// Carried for logging only; the reconciler never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Added => "added",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

/// A wake-up signal for one declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileEvent {
    /// What the control plane said happened.
    pub kind: EventKind,

    /// Which declaration to reconcile.
    pub key: ObjectKey,

    /// Resource version of the object in the notification, if present.
    ///
    /// Used as the watch resume point, not for decisions.
    pub resource_version: Option<String>,
}

impl ReconcileEvent {
    /// Create a new event.
    pub fn new(kind: EventKind, key: ObjectKey) -> Self {
        Self {
            kind,
            key,
            resource_version: None,
        }
    }

    /// Attach the notification's resource version.
    pub fn with_resource_version(mut self, resource_version: impl Into<String>) -> Self {
        self.resource_version = Some(resource_version.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_display() {
        let key = ObjectKey::new("default", "orders");
        assert_eq!(key.to_string(), "default/orders");
    }

    #[test]
    fn test_key_parse_rejects_garbage() {
        assert!("orders".parse::<ObjectKey>().is_err());
        assert!("/orders".parse::<ObjectKey>().is_err());
        assert!("default/".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn test_event_kind_wire_names() {
        let kind: EventKind = serde_json::from_str("\"MODIFIED\"").unwrap();
        assert_eq!(kind, EventKind::Modified);
        assert_eq!(kind.to_string(), "modified");
    }

    proptest! {
        #[test]
        fn prop_key_display_parses_back(
            namespace in "[a-z0-9][a-z0-9-]{0,20}",
            name in "[a-z0-9][a-z0-9.-]{0,40}",
        ) {
            let key = ObjectKey::new(namespace, name);
            let parsed: ObjectKey = key.to_string().parse().unwrap();
            prop_assert_eq!(parsed, key);
        }
    }
}
