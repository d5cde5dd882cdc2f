//! Wire model shared by the meet-road signaling server and meet clients.
//! Kept free of runtime dependencies so both halves (and any future
//! browser bindings) agree on one definition of every frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identifier the server assigns to a socket for its whole lifetime.
pub type ConnectionId = String;

fn default_true() -> bool {
    true
}

/// One roster entry as broadcast by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub id: ConnectionId,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub has_audio: bool,
    #[serde(default = "default_true")]
    pub has_video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Sender connection id.
    pub id: ConnectionId,
    pub display_name: String,
    pub text: String,
    /// Client-assigned id used to match the sender's optimistic echo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Messages sent from a client to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_token: String,
        display_name: String,
    },
    LeaveRoom {
        room_token: String,
    },
    RelayMessage {
        room_token: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    Offer {
        target_id: ConnectionId,
        payload: Value,
    },
    Answer {
        target_id: ConnectionId,
        payload: Value,
    },
    Candidate {
        target_id: ConnectionId,
        payload: Value,
    },
    MediaStatusChanged {
        room_token: String,
        has_audio: bool,
        has_video: bool,
    },
    /// Heartbeat to keep the connection alive
    Ping,
}

/// Messages sent from the signaling server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First frame on every socket; tells the client its own id.
    Connected {
        connection_id: ConnectionId,
    },
    /// Full roster, sent to the joiner only.
    RoomUsers {
        users: Vec<MemberInfo>,
    },
    /// Full roster, broadcast on any membership change.
    RoomUsersChanged {
        users: Vec<MemberInfo>,
    },
    MemberJoined {
        id: ConnectionId,
        display_name: String,
    },
    MemberLeft {
        id: ConnectionId,
        display_name: String,
    },
    RelayMessage(ChatMessage),
    RelayMessageConfirm(ChatMessage),
    Offer {
        sender_id: ConnectionId,
        payload: Value,
    },
    Answer {
        sender_id: ConnectionId,
        payload: Value,
    },
    Candidate {
        sender_id: ConnectionId,
        payload: Value,
    },
    UserMediaStatusChanged {
        user_id: ConnectionId,
        has_audio: bool,
        has_video: bool,
    },
    Pong,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Extracts the typed signal from a relayed offer/answer/candidate frame.
    /// Returns `None` for every other frame.
    pub fn signal(&self) -> Option<Result<(ConnectionId, SignalPayload), ProtoError>> {
        let (sender_id, kind, payload) = match self {
            ServerMessage::Offer { sender_id, payload } => (sender_id, SignalKind::Offer, payload),
            ServerMessage::Answer { sender_id, payload } => {
                (sender_id, SignalKind::Answer, payload)
            }
            ServerMessage::Candidate { sender_id, payload } => {
                (sender_id, SignalKind::Candidate, payload)
            }
            _ => return None,
        };
        Some(SignalPayload::decode(kind, payload).map(|signal| (sender_id.clone(), signal)))
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{found} description relayed as {expected}")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// A session description in the shape browsers produce (`{ type, sdp }`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

/// Typed view of the payloads the server relays without looking at them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    fn decode(kind: SignalKind, payload: &Value) -> Result<Self, ProtoError> {
        let invalid = |source| ProtoError::InvalidPayload {
            kind: kind.as_str(),
            source,
        };
        match kind {
            SignalKind::Candidate => serde_json::from_value(payload.clone())
                .map(SignalPayload::Candidate)
                .map_err(invalid),
            SignalKind::Offer | SignalKind::Answer => {
                let description: SessionDescription =
                    serde_json::from_value(payload.clone()).map_err(invalid)?;
                match (kind, description.kind) {
                    (SignalKind::Offer, SdpKind::Offer) => Ok(SignalPayload::Offer(description)),
                    (SignalKind::Answer, SdpKind::Answer) => {
                        Ok(SignalPayload::Answer(description))
                    }
                    (expected, found) => Err(ProtoError::KindMismatch {
                        expected: expected.as_str(),
                        found: found.as_str(),
                    }),
                }
            }
        }
    }

    /// Wraps the payload into the relay frame addressed to `target_id`.
    pub fn into_client_message(
        self,
        target_id: impl Into<ConnectionId>,
    ) -> Result<ClientMessage, serde_json::Error> {
        let target_id = target_id.into();
        Ok(match self {
            SignalPayload::Offer(description) => ClientMessage::Offer {
                target_id,
                payload: serde_json::to_value(description)?,
            },
            SignalPayload::Answer(description) => ClientMessage::Answer {
                target_id,
                payload: serde_json::to_value(description)?,
            },
            SignalPayload::Candidate(candidate) => ClientMessage::Candidate {
                target_id,
                payload: serde_json::to_value(candidate)?,
            },
        })
    }
}
