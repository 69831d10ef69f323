//! Wire envelope exchanged over the signaling socket.
//!
//! Only `type` and `id` carry meaning to the relay. Every other top-level field is kept in
//! [`Envelope::payload`] and written back out untouched, numbers included: `serde_json` is
//! built with `arbitrary_precision`, so a value is re-emitted as the text it arrived as.

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

use crate::error::RelayError;
use crate::ice::IceServer;
use crate::identity::Identity;

/// Envelope tag. The four named tags are the ones the relay itself emits or tracks;
/// everything else (`offer`, `candidate`, ...) is passed through as [`EnvelopeKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Hello,
    IceServers,
    Answer,
    Bye,
    Other(String),
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            EnvelopeKind::Hello => "hello",
            EnvelopeKind::IceServers => "iceServers",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::Bye => "bye",
            EnvelopeKind::Other(other) => other,
        }
    }
}

impl From<String> for EnvelopeKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "hello" => EnvelopeKind::Hello,
            "iceServers" => EnvelopeKind::IceServers,
            "answer" => EnvelopeKind::Answer,
            "bye" => EnvelopeKind::Bye,
            _ => EnvelopeKind::Other(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: Option<EnvelopeKind>,
    /// Recipient on the way in, sender on the way out.
    pub id: Option<Identity>,
    /// Remaining top-level fields in arrival order.
    pub payload: Map<String, Value>,
}

impl Envelope {
    fn new(kind: EnvelopeKind, id: Option<Identity>) -> Self {
        Self {
            kind: Some(kind),
            id,
            payload: Map::new(),
        }
    }

    /// Parse an inbound text frame. Anything that is not a JSON object is rejected, as is a
    /// `type` or `id` that is present but not a string (`null` included).
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let mut payload: Map<String, Value> = serde_json::from_str(raw)?;
        let kind = take_string(&mut payload, "type")?.map(EnvelopeKind::from);
        let id = take_string(&mut payload, "id")?.map(Identity::from);
        Ok(Self { kind, id, payload })
    }

    pub fn hello(assigned: &Identity) -> Self {
        Self::new(EnvelopeKind::Hello, Some(assigned.clone()))
    }

    pub fn ice_servers(servers: &[IceServer], warning: Option<&str>) -> Result<Self, RelayError> {
        let mut envelope = Self::new(EnvelopeKind::IceServers, None);
        envelope
            .payload
            .insert("iceServers".to_string(), serde_json::to_value(servers)?);
        if let Some(warning) = warning {
            envelope
                .payload
                .insert("warning".to_string(), Value::String(warning.to_string()));
        }
        Ok(envelope)
    }

    /// Termination notice sent on behalf of a connection that went away.
    pub fn bye(from: &Identity) -> Self {
        Self::new(EnvelopeKind::Bye, Some(from.clone()))
    }

    pub fn to_text(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Result<Option<String>, RelayError> {
    match fields.shift_remove(key) {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(RelayError::MalformedEnvelope(format!(
            "`{key}` must be a string, got {other}"
        ))),
    }
}

/// `type` and `id` lead, followed by the payload in its original order.
impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.payload.len()
            + usize::from(self.kind.is_some())
            + usize::from(self.id.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(kind) = &self.kind {
            map.serialize_entry("type", kind.as_str())?;
        }
        if let Some(id) = &self.id {
            map.serialize_entry("id", id)?;
        }
        for (key, value) in &self.payload {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}
