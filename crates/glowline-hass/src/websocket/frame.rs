//! JSON frames exchanged with the Home Assistant websocket API.

use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{HassError, Result};

/// An RGB color triple.
pub type RgbColor = [u8; 3];

/// Discriminator of an inbound frame, taken from its `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Server hello asking the client to authenticate.
    AuthRequired,
    /// Authentication accepted.
    AuthOk,
    /// Authentication rejected. The server closes the connection afterwards.
    AuthInvalid,
    /// Server asks the client to end the session.
    Close,
    /// Event pushed by a subscription.
    Event,
    /// Acknowledgement of a command.
    Result,
    /// Any other type.
    Other,
}

impl FrameKind {
    /// Classify a `type` value.
    pub fn from_type(ty: &str) -> Self {
        match ty {
            "auth_required" => Self::AuthRequired,
            "auth_ok" => Self::AuthOk,
            "auth_invalid" => Self::AuthInvalid,
            "close" => Self::Close,
            "event" => Self::Event,
            "result" => Self::Result,
            _ => Self::Other,
        }
    }

    /// Whether this kind belongs to the authentication handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::AuthRequired | Self::AuthOk | Self::AuthInvalid)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthRequired => write!(f, "auth_required"),
            Self::AuthOk => write!(f, "auth_ok"),
            Self::AuthInvalid => write!(f, "auth_invalid"),
            Self::Close => write!(f, "close"),
            Self::Event => write!(f, "event"),
            Self::Result => write!(f, "result"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A decoded inbound text frame.
///
/// The full JSON object is kept as the payload so handlers see exactly what
/// the server sent.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundFrame {
    kind: FrameKind,
    payload: Value,
}

impl InboundFrame {
    /// Decode a text frame.
    ///
    /// Fails with [`HassError::Protocol`] if the text is not a JSON object
    /// with a string `type` field.
    pub fn parse(text: &str) -> Result<Self> {
        let payload: Value = serde_json::from_str(text)
            .map_err(|e| HassError::Protocol(format!("malformed frame: {e}")))?;
        Self::from_value(payload)
    }

    /// Classify an already decoded JSON value.
    pub fn from_value(payload: Value) -> Result<Self> {
        let kind = match payload.get("type").and_then(Value::as_str) {
            Some(ty) => FrameKind::from_type(ty),
            None => {
                return Err(HassError::Protocol(
                    "frame has no string 'type' field".into(),
                ));
            }
        };
        Ok(Self { kind, payload })
    }

    /// The frame's kind.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// The raw `type` string.
    pub fn type_name(&self) -> &str {
        self.payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The full JSON object.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consume the frame and return its JSON object.
    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// The `message` field, present on `auth_invalid` and error results.
    pub fn message(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }
}

/// Client authentication frame: `{"type": "auth", "access_token": ...}`.
#[derive(Serialize)]
pub(crate) struct AuthRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    access_token: &'a str,
}

impl<'a> AuthRequest<'a> {
    pub(crate) fn new(access_token: &'a str) -> Self {
        Self {
            kind: "auth",
            access_token,
        }
    }

    pub(crate) fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Entity selector for a service call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceTarget {
    /// Target entity, e.g. `light.desk`.
    pub entity_id: String,
}

impl ServiceTarget {
    /// Target a single entity.
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
        }
    }
}

/// Body of an outbound command, tagged by its `type` field.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandBody {
    /// Call a service in a domain.
    CallService {
        /// Service domain, e.g. `light`.
        domain: String,
        /// Service name, e.g. `turn_on`.
        service: String,
        /// Service parameters.
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<Value>,
        /// Entity selector.
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<ServiceTarget>,
    },
    /// Subscribe to the event bus, optionally to one event type.
    SubscribeEvents {
        /// Event type filter.
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    /// Application-level ping; the server answers with `pong`.
    Ping,
}

impl CommandBody {
    /// Build a `call_service` body.
    pub fn call_service(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: Option<Value>,
        target: Option<ServiceTarget>,
    ) -> Self {
        Self::CallService {
            domain: domain.into(),
            service: service.into(),
            service_data,
            target,
        }
    }

    /// `light.turn_on` with an RGB color for `light.<entity>`.
    pub fn light_turn_on(rgb: RgbColor, entity: &str) -> Self {
        Self::call_service(
            "light",
            "turn_on",
            Some(json!({ "rgb_color": rgb })),
            Some(ServiceTarget::entity(format!("light.{entity}"))),
        )
    }

    /// Build a `subscribe_events` body.
    pub fn subscribe_events(event_type: Option<String>) -> Self {
        Self::SubscribeEvents { event_type }
    }
}

/// A command with its request id, as written to the wire.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundCommand {
    /// Request id, unique within one session.
    pub id: u64,
    /// Command type and parameters.
    #[serde(flatten)]
    pub body: CommandBody,
}

impl OutboundCommand {
    /// Pair a body with a request id.
    pub fn new(id: u64, body: CommandBody) -> Self {
        Self { id, body }
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
