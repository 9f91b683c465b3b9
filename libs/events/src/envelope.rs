//! List/watch wire format.
//!
//! A watch body is newline-delimited JSON, one [`WatchEnvelope`] per line:
//!
//! ```text
//! {"type":"ADDED","object":{"metadata":{"namespace":"default","name":"orders","resourceVersion":"41"}, ...}}
//! {"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"57"}}}
//! {"type":"ERROR","object":{"kind":"Status","code":410,"message":"too old resource version"}}
//! ```

use serde::Deserialize;

use crate::{EventError, EventKind, ObjectKey, ReconcileEvent};

/// HTTP-style status code the control plane uses for an expired resume point.
pub const STATUS_GONE: u16 = 410;

/// Raw watch line as sent by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub object: serde_json::Value,
}

/// Minimal metadata every listed or watched object carries.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default)]
    pub metadata: RefMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub resource_version: Option<String>,
}

impl ObjectRef {
    /// Identity of the object, if its metadata names one.
    pub fn key(&self) -> Result<ObjectKey, EventError> {
        let name = self
            .metadata
            .name
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(EventError::MissingField("metadata.name"))?;
        let namespace = self
            .metadata
            .namespace
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(EventError::MissingField("metadata.namespace"))?;
        Ok(ObjectKey::new(namespace, name))
    }
}

/// A status object sent in `ERROR` notifications.
#[derive(Debug, Clone, Default, Deserialize)]
struct StatusObject {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

/// A decoded watch line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A declaration changed; reconcile it.
    Change(ReconcileEvent),

    /// Resume point advanced with no object change.
    Bookmark { resource_version: String },

    /// The resume point is too old; re-list from scratch.
    Expired { message: String },

    /// The control plane reported some other error on the stream.
    Failed { code: Option<u16>, message: String },
}

impl Notification {
    /// Decode one line of a watch body.
    pub fn from_line(line: &[u8]) -> Result<Self, EventError> {
        let envelope: WatchEnvelope = serde_json::from_slice(line)?;
        Self::from_envelope(envelope)
    }

    /// Decode an already-parsed envelope.
    pub fn from_envelope(envelope: WatchEnvelope) -> Result<Self, EventError> {
        let kind = match envelope.event_type.as_str() {
            "ADDED" => EventKind::Added,
            "MODIFIED" => EventKind::Modified,
            "DELETED" => EventKind::Deleted,
            "BOOKMARK" => {
                let object: ObjectRef = serde_json::from_value(envelope.object)?;
                let resource_version = object
                    .metadata
                    .resource_version
                    .ok_or(EventError::MissingField("metadata.resourceVersion"))?;
                return Ok(Notification::Bookmark { resource_version });
            }
            "ERROR" => {
                let status: StatusObject = serde_json::from_value(envelope.object)?;
                let message = status.message.unwrap_or_default();
                if status.code == Some(STATUS_GONE) {
                    return Ok(Notification::Expired { message });
                }
                return Ok(Notification::Failed {
                    code: status.code,
                    message,
                });
            }
            other => return Err(EventError::UnknownEventType(other.to_string())),
        };

        if !envelope.object.is_object() {
            return Err(EventError::InvalidPayload(format!(
                "{} notification object is not a JSON object",
                envelope.event_type
            )));
        }

        let object: ObjectRef = serde_json::from_value(envelope.object)?;
        let key = object.key()?;
        let mut event = ReconcileEvent::new(kind, key);
        if let Some(rv) = object.metadata.resource_version {
            event = event.with_resource_version(rv);
        }
        Ok(Notification::Change(event))
    }
}

/// A list response: every current object plus the version to watch from.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListSnapshot {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<ObjectRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default)]
    pub resource_version: Option<String>,
}

impl ListSnapshot {
    /// Decode a list response body.
    pub fn from_slice(body: &[u8]) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Initial-sync events, one `Added` per listed object.
    ///
    /// Items without a usable identity are returned as errors so the caller
    /// can log and skip them.
    pub fn events(&self) -> Vec<Result<ReconcileEvent, EventError>> {
        self.items
            .iter()
            .map(|item| {
                let mut event = ReconcileEvent::new(EventKind::Added, item.key()?);
                if let Some(rv) = &item.metadata.resource_version {
                    event = event.with_resource_version(rv.clone());
                }
                Ok(event)
            })
            .collect()
    }
}

/// Longest partial line [`LineDecoder`] holds before giving up.
pub const MAX_PENDING_LINE: usize = 4 * 1024 * 1024; // 4 MiB

/// Splits a chunked byte stream into complete lines.
///
/// Chunk boundaries from the transport are arbitrary; a JSON line may span
/// several chunks, and one chunk may hold several lines.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_LINE)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that rejects partial lines longer than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Feed a chunk and return every line it completed (without the newline).
    /// Blank lines are dropped.
    ///
    /// Fails once the unterminated tail outgrows the limit; the buffer is
    /// discarded and the stream should be abandoned.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, EventError> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line);
            }
        }

        if self.buf.len() > self.limit {
            let pending = self.buf.len();
            self.buf = Vec::new();
            return Err(EventError::InvalidPayload(format!(
                "unterminated line of {pending} bytes exceeds {} byte limit",
                self.limit
            )));
        }
        Ok(lines)
    }

    /// Bytes received after the last newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
