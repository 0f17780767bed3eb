//! Protocol message types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::events;

/// Relay-assigned identifier of one logical connection
pub type SessionId = String;

/// Identity advertised to the relay once per successful connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub hostname: String,
    #[serde(rename = "type")]
    pub server_type: String,
}

impl Registration {
    pub fn new(hostname: impl Into<String>, server_type: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            server_type: server_type.into(),
        }
    }
}

/// Error detail carried by `error` frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

/// Wire envelope shared by both directions: `{event, payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// Session-scoped payload as it appears inside the envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    #[serde(
        rename = "socketId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub socket_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl SessionPayload {
    pub fn for_session(socket_id: &str) -> Self {
        Self {
            socket_id: Some(socket_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(ErrorInfo {
            message: message.into(),
        });
        self
    }
}

/// Frames sent by the relay to the client
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Relay requests a new session
    Connect { socket_id: SessionId },
    /// Payload for an existing session
    Data { socket_id: SessionId, data: Bytes },
    /// Relay aborts a session
    SocketError { socket_id: SessionId },
    /// Relay closes a session gracefully
    End { socket_id: SessionId },
    /// Relay acknowledges the registration; the payload is opaque to the client
    Registered { info: serde_json::Value },
}

impl InboundFrame {
    /// Canonical event name
    pub fn event(&self) -> &'static str {
        match self {
            InboundFrame::Connect { .. } => events::CONNECT,
            InboundFrame::Data { .. } => events::DATA,
            InboundFrame::SocketError { .. } => events::SOCKET_ERROR,
            InboundFrame::End { .. } => events::END,
            InboundFrame::Registered { .. } => events::REGISTERED,
        }
    }

    pub fn socket_id(&self) -> Option<&str> {
        match self {
            InboundFrame::Connect { socket_id }
            | InboundFrame::Data { socket_id, .. }
            | InboundFrame::SocketError { socket_id }
            | InboundFrame::End { socket_id } => Some(socket_id),
            InboundFrame::Registered { .. } => None,
        }
    }
}

/// Frames sent by the client to the relay
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Identity handshake, sent once per transition into Connected
    RegisterServer(Registration),
    /// Bytes read from the local socket of a session
    Data { socket_id: SessionId, data: Bytes },
    /// Local socket failure other than refusal
    Error { socket_id: SessionId, message: String },
    /// The local side of a session is gone
    DisconnectClient { socket_id: SessionId },
    /// The local target refused the connection
    AbortClient { socket_id: SessionId },
}

impl OutboundFrame {
    /// Canonical event name
    pub fn event(&self) -> &'static str {
        match self {
            OutboundFrame::RegisterServer(_) => events::REGISTER_SERVER,
            OutboundFrame::Data { .. } => events::DATA,
            OutboundFrame::Error { .. } => events::ERROR,
            OutboundFrame::DisconnectClient { .. } => events::DISCONNECT_CLIENT,
            OutboundFrame::AbortClient { .. } => events::ABORT_CLIENT,
        }
    }

    pub fn socket_id(&self) -> Option<&str> {
        match self {
            OutboundFrame::RegisterServer(_) => None,
            OutboundFrame::Data { socket_id, .. }
            | OutboundFrame::Error { socket_id, .. }
            | OutboundFrame::DisconnectClient { socket_id }
            | OutboundFrame::AbortClient { socket_id } => Some(socket_id),
        }
    }
}

// Payload bytes travel as base64 strings inside the JSON envelope
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Bytes>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| {
                STANDARD
                    .decode(encoded)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
