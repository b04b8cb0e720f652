//! Wire envelope for branch completions and merged completions.
//!
//! Everything that crosses the event bus is a [`SerializedEvent`]:
//!
//! - `event_type`: the branch tag for a branch completion, `"MergedCompletion.v1"`
//!   for the barrier's output
//! - `data`: the JSON-encoded payload object
//! - `metadata`: JSON object carrying at least `correlation_id`
//!
//! Payloads are opaque JSON objects, so the envelope data is JSON rather than
//! a binary encoding.

use crate::correlation::{BranchTag, CorrelationId, WorkflowType};
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Metadata key holding the correlation id.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Metadata key holding the workflow type.
pub const WORKFLOW_TYPE_KEY: &str = "workflow_type";

/// Event type of the barrier's output event.
pub const MERGED_EVENT_TYPE: &str = "MergedCompletion.v1";

/// Error types for event encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize an event.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize an event.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// A required metadata field is absent or blank.
    #[error("Event is missing metadata field '{0}'")]
    MissingMetadata(&'static str),

    /// The event is not of the expected type.
    #[error("Unexpected event type: {0}")]
    UnexpectedEventType(String),
}

/// A serialized event as carried by the event bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// Branch tag or merged event type.
    pub event_type: String,

    /// JSON-encoded payload object.
    pub data: Vec<u8>,

    /// Optional JSON metadata (`correlation_id`, `workflow_type`, ...).
    pub metadata: Option<Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(event_type: String, data: Vec<u8>, metadata: Option<Value>) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Read a string metadata field.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Correlation id carried in metadata, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.metadata_str(CORRELATION_ID_KEY).map(CorrelationId::from)
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}

fn decode_payload(data: &[u8]) -> Result<Payload, EventError> {
    match serde_json::from_slice::<Value>(data) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(EventError::DeserializationError(format!(
            "payload must be a JSON object, got {other}"
        ))),
        Err(e) => Err(EventError::DeserializationError(e.to_string())),
    }
}

fn encode_payload(payload: &Payload) -> Result<Vec<u8>, EventError> {
    serde_json::to_vec(payload).map_err(|e| EventError::SerializationError(e.to_string()))
}

/// A branch reporting that it finished for one workflow instance.
///
/// # Example
///
/// ```
/// use fanin_core::event::BranchCompletion;
/// use serde_json::json;
///
/// let completion = BranchCompletion::new(
///     "trace-1",
///     "inventory.checked",
///     json!({"allAvailable": true}).as_object().cloned().unwrap(),
/// );
/// let wire = completion.to_serialized().unwrap();
/// assert_eq!(wire.event_type, "inventory.checked");
///
/// let decoded = BranchCompletion::from_serialized(&wire).unwrap();
/// assert_eq!(decoded, completion);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct BranchCompletion {
    /// Instance the branch belongs to.
    pub correlation_id: CorrelationId,
    /// Which branch finished.
    pub branch_tag: BranchTag,
    /// Result of the branch.
    pub payload: Payload,
}

impl BranchCompletion {
    /// Create a branch completion.
    #[must_use]
    pub fn new(
        correlation_id: impl Into<CorrelationId>,
        branch_tag: impl Into<BranchTag>,
        payload: Payload,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            branch_tag: branch_tag.into(),
            payload,
        }
    }

    /// Encode for publishing on the branch's topic.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the payload cannot be encoded.
    pub fn to_serialized(&self) -> Result<SerializedEvent, EventError> {
        Ok(SerializedEvent::new(
            self.branch_tag.to_string(),
            encode_payload(&self.payload)?,
            Some(serde_json::json!({ CORRELATION_ID_KEY: self.correlation_id })),
        ))
    }

    /// Decode a delivered branch event.
    ///
    /// # Errors
    ///
    /// - `MissingMetadata`: no correlation id or blank event type
    /// - `DeserializationError`: data is not a JSON object
    pub fn from_serialized(event: &SerializedEvent) -> Result<Self, EventError> {
        if event.event_type.trim().is_empty() {
            return Err(EventError::MissingMetadata("event_type"));
        }
        let correlation_id = event
            .correlation_id()
            .ok_or(EventError::MissingMetadata(CORRELATION_ID_KEY))?;
        Ok(Self {
            correlation_id,
            branch_tag: BranchTag::new(event.event_type.clone()),
            payload: decode_payload(&event.data)?,
        })
    }
}

/// The single combined event published when an instance completes.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedCompletion {
    /// Workflow type of the completed instance.
    pub workflow_type: WorkflowType,
    /// Instance that completed.
    pub correlation_id: CorrelationId,
    /// Deterministic merge of all branch payloads.
    pub payload: Payload,
}

impl MergedCompletion {
    /// Encode for publishing on the workflow's output topic.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the payload cannot be encoded.
    pub fn to_serialized(&self) -> Result<SerializedEvent, EventError> {
        Ok(SerializedEvent::new(
            MERGED_EVENT_TYPE.to_string(),
            encode_payload(&self.payload)?,
            Some(serde_json::json!({
                CORRELATION_ID_KEY: self.correlation_id,
                WORKFLOW_TYPE_KEY: self.workflow_type,
            })),
        ))
    }

    /// Decode a merged event received by a downstream consumer.
    ///
    /// # Errors
    ///
    /// - `UnexpectedEventType`: not a merged completion
    /// - `MissingMetadata`: correlation id or workflow type absent
    /// - `DeserializationError`: data is not a JSON object
    pub fn from_serialized(event: &SerializedEvent) -> Result<Self, EventError> {
        if event.event_type != MERGED_EVENT_TYPE {
            return Err(EventError::UnexpectedEventType(event.event_type.clone()));
        }
        let correlation_id = event
            .correlation_id()
            .ok_or(EventError::MissingMetadata(CORRELATION_ID_KEY))?;
        let workflow_type = event
            .metadata_str(WORKFLOW_TYPE_KEY)
            .map(WorkflowType::from)
            .ok_or(EventError::MissingMetadata(WORKFLOW_TYPE_KEY))?;
        Ok(Self {
            workflow_type,
            correlation_id,
            payload: decode_payload(&event.data)?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn branch_completion_requires_correlation_id() {
        let event = SerializedEvent::new("order.validated".into(), b"{}".to_vec(), None);
        assert_eq!(
            BranchCompletion::from_serialized(&event),
            Err(EventError::MissingMetadata(CORRELATION_ID_KEY))
        );
    }

    #[test]
    fn branch_completion_rejects_blank_correlation_id() {
        let event = SerializedEvent::new(
            "order.validated".into(),
            b"{}".to_vec(),
            Some(json!({ CORRELATION_ID_KEY: "  " })),
        );
        assert!(BranchCompletion::from_serialized(&event).is_err());
    }

    #[test]
    fn branch_completion_rejects_non_object_payload() {
        let event = SerializedEvent::new(
            "order.validated".into(),
            b"[1,2,3]".to_vec(),
            Some(json!({ CORRELATION_ID_KEY: "trace-1" })),
        );
        assert!(matches!(
            BranchCompletion::from_serialized(&event),
            Err(EventError::DeserializationError(_))
        ));
    }

    #[test]
    fn merged_completion_carries_workflow_type() {
        let merged = MergedCompletion {
            workflow_type: WorkflowType::new("order-processing"),
            correlation_id: CorrelationId::new("trace-1"),
            payload: json!({"readyForNextStage": true}).as_object().cloned().unwrap(),
        };

        let wire = merged.to_serialized().unwrap();
        assert_eq!(wire.event_type, MERGED_EVENT_TYPE);
        assert_eq!(wire.metadata_str(WORKFLOW_TYPE_KEY), Some("order-processing"));
        assert_eq!(MergedCompletion::from_serialized(&wire).unwrap(), merged);
    }

    #[test]
    fn merged_decoder_rejects_branch_events() {
        let wire = BranchCompletion::new("trace-1", "order.validated", Payload::new())
            .to_serialized()
            .unwrap();
        assert!(matches!(
            MergedCompletion::from_serialized(&wire),
            Err(EventError::UnexpectedEventType(_))
        ));
    }

    #[test]
    fn display_reports_size() {
        let event = SerializedEvent::new("order.validated".into(), vec![1, 2, 3], None);
        assert!(event.to_string().contains("3 bytes"));
    }
}
