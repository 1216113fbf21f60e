//! Binary wire protocol for the room session.
//!
//! Every frame is a bincode-encoded envelope carrying one event from the
//! closed client→server or server→client catalog. Frames may carry an ack
//! sequence number: the receiver answers with an `Ack` event carrying the
//! same number once the frame has been handled, which is what the reliable
//! emitter waits on.
//!
//! Server events also project to `(event name, JSON args)` pairs — the
//! shape the recorder logs and the player replays. Binary payloads survive
//! that projection byte-exactly (JSON number arrays).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::document::Patch;
use crate::registry::{Participant, PresenceUpdate};

/// Connection handshake, sent as the first frame on a new socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Signed room token; absent or invalid falls back to Candidate.
    pub token: Option<String>,
    /// With a valid token, join as Spectator instead of Host.
    pub spectator_mode: bool,
    /// Loopback-only sentinel for the session recorder.
    pub recorder_mode: bool,
    /// Present when reconnecting inside the recovery window.
    pub resume: Option<ResumeInfo>,
}

/// Reconnection claim: which connection this one replaces and the last
/// patch time that connection had seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub prior_connection: Uuid,
    pub last_patch_time: u64,
}

/// Client→server event catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    Join(JoinRequest),
    ChangeMyUser(PresenceUpdate),
    Copy,
    InputToTerminal(String),
    RequestActiveFilePath,
    ChangeActiveFilePath(String),
    RequestAvailableFiles,
    UploadFile { name: String, data: Vec<u8> },
    RequestActiveFileContent { last_patch_time: Option<u64> },
    PatchActiveFileContent(Vec<u8>),
    RequestNotesContent,
    PatchNotesContent(Vec<u8>),
    Ack(u64),
}

/// Server→client event catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    UsersChanged(Vec<Participant>),
    CandidateCopied(Uuid),
    TerminalOutputted(String),
    ActiveFilePathChanged(String),
    AvailableFilesChanged(Vec<String>),
    ActiveFileContentRewritten(Vec<u8>),
    ActiveFileContentPatched(Patch),
    NotesContentRewritten(Vec<u8>),
    NotesContentPatched(Patch),
    Ack(u64),
}

impl ServerEvent {
    /// Stable event name used in recordings and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UsersChanged(_) => "users-changed",
            Self::CandidateCopied(_) => "candidate-copied",
            Self::TerminalOutputted(_) => "terminal-outputted",
            Self::ActiveFilePathChanged(_) => "active-file-path-changed",
            Self::AvailableFilesChanged(_) => "available-files-changed",
            Self::ActiveFileContentRewritten(_) => "active-file-content-rewritten",
            Self::ActiveFileContentPatched(_) => "active-file-content-patched",
            Self::NotesContentRewritten(_) => "notes-content-rewritten",
            Self::NotesContentPatched(_) => "notes-content-patched",
            Self::Ack(_) => "ack",
        }
    }

    /// JSON argument list for the recording format.
    pub fn to_args(&self) -> Result<Vec<Value>, ProtocolError> {
        let arg = match self {
            Self::UsersChanged(users) => serde_json::to_value(users),
            Self::CandidateCopied(id) => serde_json::to_value(id),
            Self::TerminalOutputted(data) => serde_json::to_value(data),
            Self::ActiveFilePathChanged(path) => serde_json::to_value(path),
            Self::AvailableFilesChanged(files) => serde_json::to_value(files),
            Self::ActiveFileContentRewritten(snapshot) => serde_json::to_value(snapshot),
            Self::ActiveFileContentPatched(patch) => serde_json::to_value(patch),
            Self::NotesContentRewritten(snapshot) => serde_json::to_value(snapshot),
            Self::NotesContentPatched(patch) => serde_json::to_value(patch),
            Self::Ack(seq) => serde_json::to_value(seq),
        }
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(vec![arg])
    }

    /// Rebuild an event from a recorded `(name, args)` pair.
    ///
    /// This is the validation boundary for replayed recordings: unknown
    /// names and malformed args are errors, never panics.
    pub fn from_recorded(name: &str, args: &[Value]) -> Result<Self, ProtocolError> {
        let arg = args
            .first()
            .ok_or_else(|| ProtocolError::Deserialization(format!("{name}: missing args")))?
            .clone();
        let parse_err = |e: serde_json::Error| ProtocolError::Deserialization(e.to_string());
        let event = match name {
            "users-changed" => Self::UsersChanged(serde_json::from_value(arg).map_err(parse_err)?),
            "candidate-copied" => {
                Self::CandidateCopied(serde_json::from_value(arg).map_err(parse_err)?)
            }
            "terminal-outputted" => {
                Self::TerminalOutputted(serde_json::from_value(arg).map_err(parse_err)?)
            }
            "active-file-path-changed" => {
                Self::ActiveFilePathChanged(serde_json::from_value(arg).map_err(parse_err)?)
            }
            "available-files-changed" => {
                Self::AvailableFilesChanged(serde_json::from_value(arg).map_err(parse_err)?)
            }
            "active-file-content-rewritten" => {
                Self::ActiveFileContentRewritten(serde_json::from_value(arg).map_err(parse_err)?)
            }
            "active-file-content-patched" => {
                Self::ActiveFileContentPatched(serde_json::from_value(arg).map_err(parse_err)?)
            }
            "notes-content-rewritten" => {
                Self::NotesContentRewritten(serde_json::from_value(arg).map_err(parse_err)?)
            }
            "notes-content-patched" => {
                Self::NotesContentPatched(serde_json::from_value(arg).map_err(parse_err)?)
            }
            "ack" => Self::Ack(serde_json::from_value(arg).map_err(parse_err)?),
            other => {
                return Err(ProtocolError::Deserialization(format!(
                    "unknown event name: {other}"
                )))
            }
        };
        Ok(event)
    }
}

/// A client→server frame. `seq` asks the server for an ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub seq: Option<u64>,
    pub event: ClientEvent,
}

/// A server→client frame. `seq` asks the client for an ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub seq: Option<u64>,
    pub event: ServerEvent,
}

impl ClientFrame {
    pub fn new(event: ClientEvent) -> Self {
        Self { seq: None, event }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

impl ServerFrame {
    pub fn new(event: ServerEvent) -> Self {
        Self { seq: None, event }
    }

    pub fn with_seq(seq: u64, event: ServerEvent) -> Self {
        Self {
            seq: Some(seq),
            event,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
    HandshakeExpected,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::HandshakeExpected => write!(f, "first frame must be a join request"),
        }
    }
}

impl std::error::Error for ProtocolError {}
