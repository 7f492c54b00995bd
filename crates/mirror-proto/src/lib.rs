//! Shared protocol definitions for source ↔ viewer session mirroring.
//! Kept in a dedicated crate so the peers, the relay and any foreign bindings
//! agree on one vocabulary without pulling in runtime code.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One opaque unit of DOM-change data produced by the recorder.
pub type RecordedEvent = Value;

/// Node identifier inside the replayer's mirror of the source document.
pub type NodeId = u64;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("envelope {0} carries no payload")]
    MissingPayload(EventKind),
    #[error("unknown event kind {0:?}")]
    UnknownEventKind(String),
    #[error("unknown role {0:?}")]
    UnknownRole(String),
}

/// Opaque identifier shared out-of-band by both peers of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel address bound by `role` for this session: `"{session}-{role}"`.
    pub fn address(&self, role: Role) -> String {
        format!("{}-{}", self.0, role.as_str())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The embedded peer producing the recording.
    Source,
    /// The app peer replaying the recording.
    Viewer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Viewer => "viewer",
        }
    }

    pub fn counterpart(self) -> Role {
        match self {
            Role::Source => Role::Viewer,
            Role::Viewer => Role::Source,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" | "embed" => Ok(Role::Source),
            "viewer" | "app" => Ok(Role::Viewer),
            other => Err(ProtoError::UnknownRole(other.to_string())),
        }
    }
}

/// Tag of an [`Envelope`]; fixes the payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SourceReady,
    ViewerReady,
    Start,
    /// Payload: [`Chunk`].
    RecordEvent,
    /// Payload: cumulative chunk id (`u64`).
    AckRecord,
    Stop,
    RemoteControlRequest,
    RemoteControlAccept,
    RemoteControlStop,
    /// Payload: [`InteractiveAction::PointerMove`].
    PointerMove,
    /// Payload: any other [`InteractiveAction`].
    RemoteInput,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::SourceReady,
        EventKind::ViewerReady,
        EventKind::Start,
        EventKind::RecordEvent,
        EventKind::AckRecord,
        EventKind::Stop,
        EventKind::RemoteControlRequest,
        EventKind::RemoteControlAccept,
        EventKind::RemoteControlStop,
        EventKind::PointerMove,
        EventKind::RemoteInput,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SourceReady => "source_ready",
            EventKind::ViewerReady => "viewer_ready",
            EventKind::Start => "start",
            EventKind::RecordEvent => "record_event",
            EventKind::AckRecord => "ack_record",
            EventKind::Stop => "stop",
            EventKind::RemoteControlRequest => "remote_control_request",
            EventKind::RemoteControlAccept => "remote_control_accept",
            EventKind::RemoteControlStop => "remote_control_stop",
            EventKind::PointerMove => "pointer_move",
            EventKind::RemoteInput => "remote_input",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtoError::UnknownEventKind(s.to_string()))
    }
}

/// A buffered recorded event tagged with its per-run sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk<T = RecordedEvent> {
    pub id: u64,
    pub data: T,
}

/// One protocol message: `{ "event": <kind>, "payload": <optional> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default)]
    payload: Option<Value>,
}

impl Envelope {
    pub fn new(event: EventKind) -> Self {
        Self {
            event,
            payload: None,
        }
    }

    pub fn with_payload<T: Serialize>(event: EventKind, payload: &T) -> Result<Self, ProtoError> {
        let payload = serde_json::to_value(payload).map_err(ProtoError::Encode)?;
        Ok(Self {
            event,
            payload: Some(payload),
        })
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        let payload = self
            .payload
            .clone()
            .ok_or(ProtoError::MissingPayload(self.event))?;
        serde_json::from_value(payload).map_err(ProtoError::Decode)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self).map_err(ProtoError::Encode)
    }

    /// Decodes one wire message. Well-formed messages whose `event` is not part
    /// of this vocabulary yield `Ok(None)` so receivers can skip them.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, ProtoError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(ProtoError::Decode)?;
        match raw.event.parse::<EventKind>() {
            Ok(event) => Ok(Some(Self {
                event,
                payload: raw.payload,
            })),
            Err(_) => Ok(None),
        }
    }
}

/// Local interactive action captured on the viewer while it holds control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractiveAction {
    PointerMove {
        x: f64,
        y: f64,
    },
    PointerDown {
        target: Option<NodeId>,
        x: f64,
        y: f64,
    },
    PointerUp {
        target: Option<NodeId>,
        x: f64,
        y: f64,
    },
    Click {
        target: Option<NodeId>,
        x: f64,
        y: f64,
    },
    Scroll {
        target: Option<NodeId>,
        x: f64,
        y: f64,
    },
    Input {
        target: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checked: Option<bool>,
    },
    Key {
        target: Option<NodeId>,
        key: String,
    },
}

impl InteractiveAction {
    pub fn event_kind(&self) -> EventKind {
        match self {
            InteractiveAction::PointerMove { .. } => EventKind::PointerMove,
            _ => EventKind::RemoteInput,
        }
    }
}

/// Everything the remote-control handshake puts on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteControl {
    Request,
    Accept,
    Stop,
    Action(InteractiveAction),
}

impl RemoteControl {
    pub fn event_kind(&self) -> EventKind {
        match self {
            RemoteControl::Request => EventKind::RemoteControlRequest,
            RemoteControl::Accept => EventKind::RemoteControlAccept,
            RemoteControl::Stop => EventKind::RemoteControlStop,
            RemoteControl::Action(action) => action.event_kind(),
        }
    }

    pub fn into_envelope(self) -> Result<Envelope, ProtoError> {
        match self {
            RemoteControl::Action(action) => Envelope::with_payload(action.event_kind(), &action),
            other => Ok(Envelope::new(other.event_kind())),
        }
    }
}

/// Custom marker events the source writes into its own recording stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomEventTag {
    AcceptRemoteControl,
}

impl CustomEventTag {
    pub fn as_str(self) -> &'static str {
        match self {
            CustomEventTag::AcceptRemoteControl => "accept_remote_control",
        }
    }
}
