//! # insider — per-room real-time session engine
//!
//! Runs one collaborative coding room: a CRDT-backed shared document, a
//! shared shell, role-gated presence, and an event-sourced recording of
//! everything that happened, replayable later at any speed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐    WebSocket     ┌──────────────┐
//! │ Host     │ ◄───────────────► │  RoomServer  │
//! │ Candidate│   Binary frames   │  (per room)  │
//! │ Spectator│                   └──────┬───────┘
//! └──────────┘                          │ SessionCommand
//!                                       ▼
//!                               ┌──────────────┐
//!                               │ RoomSession  │  single-writer task
//!                               └──────┬───────┘
//!                ┌──────────────┬──────┴──────┬──────────────┐
//!                ▼              ▼             ▼              ▼
//!          Document (yrs)  TerminalBridge  FileStore   SessionRecorder
//!          + PatchHistory  (PTY shell)     + watcher   (crash log → gzip)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded frames)
//! - [`document`] — CRDT text document and binary patches
//! - [`history`] — Patch log for reconnection recovery
//! - [`registry`] — Roles, colors, and presence views
//! - [`broadcast`] — Role-filtered fan-out
//! - [`emitter`] — At-least-once delivery with ack tracking
//! - [`terminal`] — Supervised PTY shell shared by the room
//! - [`files`] — Working-directory file set and change watching
//! - [`auth`] — Token verification and role resolution
//! - [`session`] — The per-room single-writer task
//! - [`server`] — WebSocket accept loop and connection pumps
//! - [`config`] — Environment-derived room configuration
//! - [`recorder`] — Event-sourced session capture
//! - [`player`] — Deterministic, scrubable playback

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod document;
pub mod emitter;
pub mod files;
pub mod history;
pub mod player;
pub mod protocol;
pub mod recorder;
pub mod registry;
pub mod server;
pub mod session;
pub mod terminal;

// Re-exports for convenience
pub use auth::{resolve_role, AuthError, RoomClaims, TokenVerifier};
pub use broadcast::BroadcastRouter;
pub use config::{RoomInfo, SessionConfig};
pub use document::{Document, DocumentError, Patch};
pub use emitter::{DeliveryError, ReliableEmitter};
pub use files::{FileError, FileStore};
pub use history::PatchHistory;
pub use player::{PlaybackSignal, Player};
pub use protocol::{
    ClientEvent, ClientFrame, JoinRequest, ProtocolError, ResumeInfo, ServerEvent, ServerFrame,
};
pub use recorder::{RecordedEvent, Recording, RecorderError, SessionRecorder};
pub use registry::{Participant, PresenceUpdate, Role, SessionRegistry};
pub use server::{RoomServer, ServerError};
pub use session::{RoomSession, SessionCommand, SessionError, SessionHandle};
pub use terminal::{TerminalBridge, TerminalError};
