//! WebSocket front door for one room.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── RoomSession ── Document / Registry / History
//! Client B ──┘        │
//!                     ├── TerminalBridge (PTY shell)
//!                     ├── FileStore + watcher
//!                     └── SessionRecorder (crash log → artifact)
//! ```
//!
//! Each accepted socket runs its own task: it performs the join handshake,
//! resolves the connection's role, then pumps decoded frames into the
//! session and session output back onto the wire. The session never sees
//! sockets, only channels.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::{resolve_role, AuthError, TokenVerifier};
use crate::config::SessionConfig;
use crate::protocol::{ClientEvent, ClientFrame, JoinRequest, ProtocolError};
use crate::session::{RoomSession, SessionCommand, SessionError, SessionHandle};

/// Server errors.
#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Protocol(ProtocolError),
    Auth(AuthError),
    Session(SessionError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::WebSocket(e) => write!(f, "websocket error: {e}"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Auth(e) => write!(f, "{e}"),
            Self::Session(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e)
    }
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<AuthError> for ServerError {
    fn from(e: AuthError) -> Self {
        Self::Auth(e)
    }
}

impl From<SessionError> for ServerError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

/// Accepts sockets and hands each one to the room session.
pub struct RoomServer {
    listener: TcpListener,
    session: SessionHandle,
    verifier: Option<Arc<TokenVerifier>>,
    room_id: String,
}

impl RoomServer {
    /// Bind the listener, start the room session, and load the token
    /// verification key when one is configured.
    pub async fn bind(config: SessionConfig) -> Result<Self, ServerError> {
        let verifier = match &config.jwt_public_key_path {
            Some(path) => Some(Arc::new(TokenVerifier::from_pem_file(path)?)),
            None => {
                warn!("no verification key configured; every remote join is a candidate");
                None
            }
        };
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let room_id = config.room.id.clone();
        let session = RoomSession::spawn(config)?;
        Ok(Self {
            listener,
            session,
            verifier,
            room_id,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the room session, for shutdown and finalization.
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        info!("room {} accepting connections", self.room_id);
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let session = self.session.clone();
            let verifier = self.verifier.clone();
            let room_id = self.room_id.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, session, verifier, room_id).await {
                    debug!("connection from {addr} ended: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    session: SessionHandle,
    verifier: Option<Arc<TokenVerifier>>,
    room_id: String,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let join = read_join(&mut ws_receiver).await?;
    let role = resolve_role(&join, addr.ip().is_loopback(), verifier.as_deref(), &room_id);
    let id = Uuid::new_v4();
    info!("connection {id} from {addr} joined as {role:?}");

    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .command(SessionCommand::Connect {
            id,
            role,
            tx,
            resume: join.resume,
        })
        .await?;

    let result: Result<(), ServerError> = async {
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(frame) => {
                        let encoded = frame.encode()?;
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }
                    // Session dropped the channel; the room is closing.
                    None => break,
                },
                inbound = ws_receiver.next() => match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        match ClientFrame::decode(&data) {
                            Ok(frame) => {
                                session
                                    .command(SessionCommand::Client { id, frame })
                                    .await?;
                            }
                            Err(e) => debug!("undecodable frame from {id}: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("socket error on {id}: {e}");
                        break;
                    }
                },
            }
        }
        Ok(())
    }
    .await;

    let _ = session.command(SessionCommand::Disconnect { id }).await;
    info!("connection {id} closed");
    result
}

/// The first meaningful frame on a socket must be a join request.
async fn read_join<S>(ws_receiver: &mut S) -> Result<JoinRequest, ServerError>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => {
                let frame = ClientFrame::decode(&data)?;
                return match frame.event {
                    ClientEvent::Join(join) => Ok(join),
                    _ => Err(ProtocolError::HandshakeExpected.into()),
                };
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) => return Err(ProtocolError::HandshakeExpected.into()),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ProtocolError::ConnectionClosed.into()),
        }
    }
}
