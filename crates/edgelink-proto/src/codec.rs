//! Codec for encoding/decoding control channel frames
//!
//! Frames are JSON envelopes `{"event": ..., "payload": {...}}`, one per
//! WebSocket text message. Session payload bytes are base64 encoded.

use crate::events;
use crate::messages::{Envelope, InboundFrame, OutboundFrame, Registration, SessionPayload};
use bytes::Bytes;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Missing socketId in '{0}' frame")]
    MissingSocketId(String),

    #[error("Missing {field} in '{event}' frame")]
    MissingField { event: String, field: &'static str },
}

/// Control channel frame codec
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a client frame for the wire
    pub fn encode_outbound(frame: &OutboundFrame) -> Result<String, CodecError> {
        let payload = match frame {
            OutboundFrame::RegisterServer(registration) => serde_json::to_value(registration)?,
            OutboundFrame::Data { socket_id, data } => {
                serde_json::to_value(SessionPayload::for_session(socket_id).with_data(data.clone()))?
            }
            OutboundFrame::Error { socket_id, message } => serde_json::to_value(
                SessionPayload::for_session(socket_id).with_error(message.clone()),
            )?,
            OutboundFrame::DisconnectClient { socket_id }
            | OutboundFrame::AbortClient { socket_id } => {
                serde_json::to_value(SessionPayload::for_session(socket_id))?
            }
        };

        Self::encode_envelope(&Envelope {
            event: frame.event().to_string(),
            payload,
        })
    }

    /// Decode a relay frame from the wire
    ///
    /// Older relay event names (`create_connection`, `_end`, `hostRegistered`)
    /// are accepted and mapped onto their canonical frames.
    pub fn decode_inbound(text: &str) -> Result<InboundFrame, CodecError> {
        let envelope = Self::decode_envelope(text)?;
        let event = envelope.event.as_str();

        match event {
            events::REGISTERED | events::LEGACY_REGISTERED => Ok(InboundFrame::Registered {
                info: envelope.payload,
            }),
            events::CONNECT | events::LEGACY_CONNECT => Ok(InboundFrame::Connect {
                socket_id: Self::session_payload(&envelope)?.0,
            }),
            events::DATA => {
                let (socket_id, payload) = Self::session_payload(&envelope)?;
                let data = payload.data.ok_or_else(|| CodecError::MissingField {
                    event: envelope.event.clone(),
                    field: "data",
                })?;
                Ok(InboundFrame::Data { socket_id, data })
            }
            events::SOCKET_ERROR => Ok(InboundFrame::SocketError {
                socket_id: Self::session_payload(&envelope)?.0,
            }),
            events::END | events::LEGACY_END => Ok(InboundFrame::End {
                socket_id: Self::session_payload(&envelope)?.0,
            }),
            other => Err(CodecError::UnknownEvent(other.to_string())),
        }
    }

    /// Encode a relay frame (used by relay-side tooling and tests)
    pub fn encode_inbound(frame: &InboundFrame) -> Result<String, CodecError> {
        let payload = match frame {
            InboundFrame::Registered { info } => info.clone(),
            InboundFrame::Data { socket_id, data } => {
                serde_json::to_value(SessionPayload::for_session(socket_id).with_data(data.clone()))?
            }
            InboundFrame::Connect { socket_id }
            | InboundFrame::SocketError { socket_id }
            | InboundFrame::End { socket_id } => {
                serde_json::to_value(SessionPayload::for_session(socket_id))?
            }
        };

        Self::encode_envelope(&Envelope {
            event: frame.event().to_string(),
            payload,
        })
    }

    /// Decode a client frame (used by relay-side tooling and tests)
    pub fn decode_outbound(text: &str) -> Result<OutboundFrame, CodecError> {
        let envelope = Self::decode_envelope(text)?;

        match envelope.event.as_str() {
            events::REGISTER_SERVER => {
                let registration: Registration = serde_json::from_value(envelope.payload)?;
                Ok(OutboundFrame::RegisterServer(registration))
            }
            events::DATA => {
                let (socket_id, payload) = Self::session_payload(&envelope)?;
                Ok(OutboundFrame::Data {
                    socket_id,
                    data: payload.data.unwrap_or_else(Bytes::new),
                })
            }
            events::ERROR => {
                let (socket_id, payload) = Self::session_payload(&envelope)?;
                Ok(OutboundFrame::Error {
                    socket_id,
                    message: payload.error.map(|e| e.message).unwrap_or_default(),
                })
            }
            events::DISCONNECT_CLIENT => Ok(OutboundFrame::DisconnectClient {
                socket_id: Self::session_payload(&envelope)?.0,
            }),
            events::ABORT_CLIENT => Ok(OutboundFrame::AbortClient {
                socket_id: Self::session_payload(&envelope)?.0,
            }),
            other => Err(CodecError::UnknownEvent(other.to_string())),
        }
    }

    fn encode_envelope(envelope: &Envelope) -> Result<String, CodecError> {
        let text = serde_json::to_string(envelope)?;
        if text.len() > crate::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(text.len()));
        }
        Ok(text)
    }

    fn decode_envelope(text: &str) -> Result<Envelope, CodecError> {
        if text.len() > crate::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Parse a session-scoped payload and require its socketId
    fn session_payload(envelope: &Envelope) -> Result<(String, SessionPayload), CodecError> {
        if envelope.payload.is_null() {
            return Err(CodecError::MissingSocketId(envelope.event.clone()));
        }
        let mut payload: SessionPayload = serde_json::from_value(envelope.payload.clone())?;
        match payload.socket_id.take() {
            Some(socket_id) if !socket_id.is_empty() => Ok((socket_id, payload)),
            _ => Err(CodecError::MissingSocketId(envelope.event.clone())),
        }
    }
}
