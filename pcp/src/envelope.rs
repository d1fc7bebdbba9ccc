//! PCP envelopes: one protocol message plus its routing metadata.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ClientError, Result};

/// One PCP message.
///
/// Envelopes are immutable; build a new one with [`Envelope::new`] instead
/// of changing an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: String,
    message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// The fields of an envelope to be built. Only `message_type` is required.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeOptions {
    /// Leave empty to get a fresh UUID.
    pub id: Option<String>,
    pub message_type: String,
    pub target: Option<String>,
    pub sender: Option<String>,
    pub in_reply_to: Option<String>,
    pub data: Option<Value>,
}

impl EnvelopeOptions {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            ..Default::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn in_reply_to(mut self, id: impl Into<String>) -> Self {
        self.in_reply_to = Some(id.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl Envelope {
    pub fn new(options: EnvelopeOptions) -> Self {
        let EnvelopeOptions {
            id,
            message_type,
            target,
            sender,
            in_reply_to,
            data,
        } = options;
        Self {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            message_type,
            target,
            sender,
            in_reply_to,
            data,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn in_reply_to(&self) -> Option<&str> {
        self.in_reply_to.as_deref()
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// The wire mapping. Absent fields are left out, never set to `null`.
    pub fn to_wire_form(&self) -> Map<String, Value> {
        let mut wire = Map::new();
        wire.insert("id".into(), Value::String(self.id.clone()));
        wire.insert(
            "message_type".into(),
            Value::String(self.message_type.clone()),
        );
        let optional = [
            ("target", self.target.clone().map(Value::String)),
            ("sender", self.sender.clone().map(Value::String)),
            ("in_reply_to", self.in_reply_to.clone().map(Value::String)),
            ("data", self.data.clone()),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                wire.insert(key.into(), value);
            }
        }
        wire
    }

    /// Serializes the wire form as JSON text.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.to_wire_form()).map_err(|e| ClientError::Encode(e.to_string()))
    }

    /// Parses a JSON text frame. `id` and `message_type` must be present.
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| ClientError::Decode(e.to_string()))
    }
}
