//! The per-room session task.
//!
//! All mutable room state (documents, presence, history, recorder) lives
//! on one task; everything else talks to it through [`SessionCommand`].
//! Connection tasks forward decoded frames in and receive [`ServerFrame`]s
//! on their outbound channels, so no lock ever guards room state.
//!
//! The session is the canonical document replica: a patch becomes part of
//! room history only once this task has applied it, stamped it with the
//! post-apply logical time, and persisted the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use tokio::sync::broadcast as tokio_broadcast;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::broadcast::BroadcastRouter;
use crate::config::SessionConfig;
use crate::document::{Document, Patch};
use crate::emitter::ReliableEmitter;
use crate::files::{self, FileError, FileStore};
use crate::history::PatchHistory;
use crate::protocol::{ClientEvent, ClientFrame, ResumeInfo, ServerEvent, ServerFrame};
use crate::recorder::{RecorderError, SessionRecorder};
use crate::registry::{Role, SessionRegistry};
use crate::terminal::{TerminalBridge, TerminalError};

const EVERYONE: &[Role] = &[Role::Host, Role::Candidate, Role::Spectator, Role::Recorder];
const PRIVILEGED: &[Role] = &[Role::Host, Role::Spectator, Role::Recorder];

/// Session errors.
#[derive(Debug)]
pub enum SessionError {
    File(FileError),
    Terminal(TerminalError),
    Recorder(RecorderError),
    /// The session task is gone.
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(e) => write!(f, "{e}"),
            Self::Terminal(e) => write!(f, "{e}"),
            Self::Recorder(e) => write!(f, "{e}"),
            Self::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<FileError> for SessionError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

impl From<TerminalError> for SessionError {
    fn from(e: TerminalError) -> Self {
        Self::Terminal(e)
    }
}

impl From<RecorderError> for SessionError {
    fn from(e: RecorderError) -> Self {
        Self::Recorder(e)
    }
}

/// Everything the session task reacts to.
pub enum SessionCommand {
    /// A connection finished its handshake with an already-decided role.
    Connect {
        id: Uuid,
        role: Role,
        tx: mpsc::UnboundedSender<ServerFrame>,
        resume: Option<ResumeInfo>,
    },
    Disconnect {
        id: Uuid,
    },
    /// A decoded frame from a connected client.
    Client {
        id: Uuid,
        frame: ClientFrame,
    },
    TerminalChunk(String),
    WorkspaceChanged,
    /// Stop the session and hand back the finalized recording.
    Finalize {
        reply: oneshot::Sender<Result<Vec<u8>, RecorderError>>,
    },
}

/// Cloneable handle for feeding commands to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// End the session; returns the gzip recording artifact.
    pub async fn finalize(&self) -> Result<Vec<u8>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Finalize { reply }).await?;
        rx.await
            .map_err(|_| SessionError::Closed)?
            .map_err(SessionError::Recorder)
    }
}

/// State owned by the session task.
pub struct RoomSession {
    config: SessionConfig,
    registry: SessionRegistry,
    router: BroadcastRouter,
    active_doc: Document,
    notes_doc: Document,
    history: PatchHistory,
    files: FileStore,
    last_files: Vec<String>,
    terminal: TerminalBridge,
    recorder: SessionRecorder,
    /// Dropped connections still inside the recovery window.
    recoverable: HashMap<Uuid, Instant>,
    /// Loops back into our own command channel; delivery tasks use it to
    /// report peers that stopped taking frames.
    commands: mpsc::Sender<SessionCommand>,
}

impl RoomSession {
    /// Start a session for `config` and return its handle.
    ///
    /// Spawns the session task plus pumps bridging terminal output and
    /// filesystem change notifications into the command channel.
    pub fn spawn(config: SessionConfig) -> Result<SessionHandle, SessionError> {
        std::fs::create_dir_all(&config.persistence_dir).map_err(FileError::Io)?;
        let files = FileStore::open(&config.work_dir, &config.start_file)?;
        let log_path = config
            .persistence_dir
            .join(format!("{}.events.log", config.room.id));
        let recorder = SessionRecorder::open(&log_path)?;
        let terminal = TerminalBridge::spawn(&config.shell, &config.work_dir)?;
        let (watcher, mut fs_events) = files::watch(&config.work_dir)?;

        let active_doc = Document::seeded(&files.read_active()?);
        let last_files = files.available_files()?;

        let (tx, rx) = mpsc::channel(256);

        let term_tx = tx.clone();
        let mut chunks = terminal.subscribe();
        tokio::spawn(async move {
            loop {
                match chunks.recv().await {
                    Ok(chunk) => {
                        if term_tx
                            .send(SessionCommand::TerminalChunk(chunk))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(tokio_broadcast::error::RecvError::Lagged(n)) => {
                        warn!("terminal output lagged, {n} chunks dropped");
                    }
                    Err(tokio_broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let watch_tx = tx.clone();
        tokio::spawn(async move {
            // The watcher stops when this pump does.
            let _watcher = watcher;
            while fs_events.recv().await.is_some() {
                if watch_tx.send(SessionCommand::WorkspaceChanged).await.is_err() {
                    break;
                }
            }
        });

        let session = RoomSession {
            config,
            registry: SessionRegistry::new(),
            router: BroadcastRouter::new(),
            active_doc,
            notes_doc: Document::new(),
            history: PatchHistory::new(),
            files,
            last_files,
            terminal,
            recorder,
            recoverable: HashMap::new(),
            commands: tx.clone(),
        };
        tokio::spawn(session.run(rx));

        Ok(SessionHandle { tx })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        info!("session started for room {}", self.config.room.id);
        if self.recorder.is_empty() {
            // Seed the recording with the starting state so playback does
            // not open on an empty room. The content snapshots matter most:
            // later patches build on the seeded document's internal state.
            self.recorder.record(&ServerEvent::ActiveFileContentRewritten(
                self.active_doc.serialize(),
            ));
            self.recorder.record(&ServerEvent::NotesContentRewritten(
                self.notes_doc.serialize(),
            ));
            self.recorder.record(&ServerEvent::ActiveFilePathChanged(
                self.files.active_path().to_owned(),
            ));
            self.recorder
                .record(&ServerEvent::AvailableFilesChanged(self.last_files.clone()));
        }

        let mut finalize_reply = None;
        while let Some(command) = rx.recv().await {
            match command {
                SessionCommand::Connect {
                    id,
                    role,
                    tx,
                    resume,
                } => self.handle_connect(id, role, tx, resume),
                SessionCommand::Disconnect { id } => self.handle_disconnect(id),
                SessionCommand::Client { id, frame } => self.handle_client(id, frame),
                SessionCommand::TerminalChunk(chunk) => {
                    let event = ServerEvent::TerminalOutputted(chunk);
                    self.recorder.record(&event);
                    self.router.broadcast(&event, EVERYONE);
                }
                SessionCommand::WorkspaceChanged => self.handle_workspace_changed(),
                SessionCommand::Finalize { reply } => {
                    finalize_reply = Some(reply);
                    break;
                }
            }
        }

        let Some(reply) = finalize_reply else {
            info!("session channel closed without finalize");
            return;
        };
        info!("finalizing session for room {}", self.config.room.id);
        let result = self
            .recorder
            .finalize(&self.config.platform_version, self.config.room.clone());
        let _ = reply.send(result);
    }

    fn handle_connect(
        &mut self,
        id: Uuid,
        role: Role,
        tx: mpsc::UnboundedSender<ServerFrame>,
        resume: Option<ResumeInfo>,
    ) {
        let emitter = Arc::new(ReliableEmitter::new(tx.clone()));
        self.registry.connect(id, role);
        self.router.attach(id, role, tx, emitter);
        debug!("connection {id} joined as {role:?}");

        let resumed = resume.filter(|r| {
            self.recoverable
                .remove(&r.prior_connection)
                .is_some_and(|since| since.elapsed() <= self.config.recovery_window)
        });

        match resumed {
            Some(r) => {
                let missed = self.history.missed_since(r.last_patch_time);
                debug!("connection {id} resumed, {} patches behind", missed.len());
                for patch in missed {
                    self.router
                        .send_to(id, ServerEvent::ActiveFileContentPatched(patch));
                }
            }
            None => {
                self.router.send_to(
                    id,
                    ServerEvent::ActiveFileContentRewritten(self.active_doc.serialize()),
                );
            }
        }
        self.router.send_to(
            id,
            ServerEvent::NotesContentRewritten(self.notes_doc.serialize()),
        );
        self.router.send_to(
            id,
            ServerEvent::ActiveFilePathChanged(self.files.active_path().to_owned()),
        );
        self.router
            .send_to(id, ServerEvent::AvailableFilesChanged(self.last_files.clone()));
        let last = self.terminal.last_chunk();
        if !last.is_empty() {
            self.router.send_to(id, ServerEvent::TerminalOutputted(last));
        }
        self.broadcast_users();
    }

    fn handle_disconnect(&mut self, id: Uuid) {
        self.router.detach(id);
        if self.registry.disconnect(id).is_some() {
            debug!("connection {id} left");
            self.recoverable.insert(id, Instant::now());
            let window = self.config.recovery_window;
            self.recoverable.retain(|_, since| since.elapsed() <= window);
            self.broadcast_users();
        }
    }

    fn handle_client(&mut self, id: Uuid, frame: ClientFrame) {
        let Some(role) = self.registry.role_of(id) else {
            debug!("frame from unknown connection {id} dropped");
            return;
        };

        match frame.event {
            ClientEvent::Join(_) => {
                warn!("connection {id} sent a second join, ignoring");
            }
            ClientEvent::ChangeMyUser(update) => {
                self.registry.apply_update(id, update);
                self.broadcast_users();
            }
            ClientEvent::Copy => {
                // Copy reporting flows candidate -> observers, never back.
                if role == Role::Candidate {
                    let event = ServerEvent::CandidateCopied(id);
                    self.recorder.record(&event);
                    self.router.broadcast(&event, PRIVILEGED);
                } else {
                    debug!("copy report from non-candidate {id} dropped");
                }
            }
            ClientEvent::InputToTerminal(data) => {
                if role == Role::Host {
                    self.terminal.write(&data);
                } else {
                    debug!("terminal input from non-host {id} dropped");
                }
            }
            ClientEvent::RequestActiveFilePath => {
                self.router.send_to(
                    id,
                    ServerEvent::ActiveFilePathChanged(self.files.active_path().to_owned()),
                );
            }
            ClientEvent::ChangeActiveFilePath(path) => {
                if role == Role::Host {
                    self.change_active_path(&path);
                } else {
                    debug!("path change from non-host {id} dropped");
                }
            }
            ClientEvent::RequestAvailableFiles => {
                self.router
                    .send_to(id, ServerEvent::AvailableFilesChanged(self.last_files.clone()));
            }
            ClientEvent::UploadFile { name, data } => {
                if role == Role::Host {
                    match self.files.store_upload(&name, &data) {
                        Ok(()) => self.refresh_files(),
                        Err(e) => warn!("upload {name} failed: {e}"),
                    }
                } else {
                    debug!("upload from non-host {id} dropped");
                }
            }
            ClientEvent::RequestActiveFileContent { last_patch_time } => match last_patch_time {
                Some(time) => {
                    for patch in self.history.missed_since(time) {
                        self.router
                            .send_to(id, ServerEvent::ActiveFileContentPatched(patch));
                    }
                }
                None => {
                    self.router.send_to(
                        id,
                        ServerEvent::ActiveFileContentRewritten(self.active_doc.serialize()),
                    );
                }
            },
            ClientEvent::PatchActiveFileContent(bytes) => {
                if role.may_edit_document() {
                    self.apply_active_patch(id, bytes);
                } else {
                    debug!("document patch from read-only {id} dropped");
                }
            }
            ClientEvent::RequestNotesContent => {
                self.router.send_to(
                    id,
                    ServerEvent::NotesContentRewritten(self.notes_doc.serialize()),
                );
            }
            ClientEvent::PatchNotesContent(bytes) => {
                if role == Role::Host {
                    self.apply_notes_patch(id, bytes);
                } else {
                    debug!("notes patch from non-host {id} dropped");
                }
            }
            ClientEvent::Ack(seq) => {
                self.router.acknowledge(id, seq);
            }
        }

        // Frames asking for an ack get one even when their event was
        // role-gated away; the sender only cares that we processed it.
        if let Some(seq) = frame.seq {
            self.router.send_to(id, ServerEvent::Ack(seq));
        }
    }

    /// Integrate a client patch into the canonical active document.
    fn apply_active_patch(&mut self, from: Uuid, bytes: Vec<u8>) {
        match self.active_doc.apply_patch(&Patch::untimed(bytes.clone())) {
            Ok(()) => {
                if let Err(e) = self.files.persist_active(&self.active_doc.view()) {
                    warn!("persisting active file failed: {e}");
                }
                let patch = Patch::timed(bytes, self.active_doc.logical_time());
                self.history.record(patch.clone());
                let event = ServerEvent::ActiveFileContentPatched(patch);
                self.recorder.record(&event);
                self.reliable_broadcast(event, EVERYONE, Some(from));
            }
            Err(e) => {
                // A replica that produces undecodable patches is beyond
                // incremental repair; rewrite it back into sync.
                warn!("rejecting document patch from {from}: {e}");
                self.router.send_to(
                    from,
                    ServerEvent::ActiveFileContentRewritten(self.active_doc.serialize()),
                );
            }
        }
    }

    fn apply_notes_patch(&mut self, from: Uuid, bytes: Vec<u8>) {
        match self.notes_doc.apply_patch(&Patch::untimed(bytes.clone())) {
            Ok(()) => {
                let patch = Patch::timed(bytes, self.notes_doc.logical_time());
                let event = ServerEvent::NotesContentPatched(patch);
                self.recorder.record(&event);
                self.reliable_broadcast(event, EVERYONE, Some(from));
            }
            Err(e) => {
                warn!("rejecting notes patch from {from}: {e}");
                self.router.send_to(
                    from,
                    ServerEvent::NotesContentRewritten(self.notes_doc.serialize()),
                );
            }
        }
    }

    fn change_active_path(&mut self, path: &str) {
        if path == self.files.active_path() {
            return;
        }
        if let Err(e) = self.files.persist_active(&self.active_doc.view()) {
            warn!("persisting {} before switch failed: {e}", self.files.active_path());
        }
        match self.files.set_active(path) {
            Ok(content) => {
                let event = ServerEvent::ActiveFilePathChanged(path.to_owned());
                self.recorder.record(&event);
                self.router.broadcast(&event, EVERYONE);
                self.rewrite_active(content);
                self.refresh_files();
            }
            Err(e) => warn!("switching active file to {path} failed: {e}"),
        }
    }

    /// Bring the canonical document in line with `content`, broadcasting
    /// the difference as an untimed patch. No-op when already identical,
    /// which keeps watcher notifications for our own writes quiet.
    fn rewrite_active(&mut self, content: String) {
        if self.active_doc.view() == content {
            return;
        }
        self.active_doc.replace(&content);
        if let Some(patch) = self.active_doc.flush_pending_patch() {
            let patch = Patch::untimed(patch.bytes);
            self.history.record(patch.clone());
            let event = ServerEvent::ActiveFileContentPatched(patch);
            self.recorder.record(&event);
            self.reliable_broadcast(event, EVERYONE, None);
        }
    }

    fn handle_workspace_changed(&mut self) {
        self.refresh_files();
        match self.files.read_active() {
            Ok(content) => self.rewrite_active(content),
            Err(e) => warn!("re-reading active file failed: {e}"),
        }
    }

    fn refresh_files(&mut self) {
        match self.files.available_files() {
            Ok(listing) => {
                if listing != self.last_files {
                    self.last_files = listing.clone();
                    let event = ServerEvent::AvailableFilesChanged(listing);
                    self.recorder.record(&event);
                    self.router.broadcast(&event, EVERYONE);
                }
            }
            Err(e) => warn!("listing working directory failed: {e}"),
        }
    }

    fn broadcast_users(&mut self) {
        let privileged = ServerEvent::UsersChanged(self.registry.users_for_privileged());
        self.recorder.record(&privileged);
        self.router.broadcast(&privileged, PRIVILEGED);
        let candidate = ServerEvent::UsersChanged(self.registry.users_for_candidates());
        self.router.broadcast(&candidate, &[Role::Candidate]);
    }

    /// At-least-once fan-out, run off the session task so a dead peer's
    /// retry cycle never stalls the room. Peers whose delivery fails are
    /// retired through the normal disconnect path.
    fn reliable_broadcast(&self, event: ServerEvent, roles: &[Role], except: Option<Uuid>) {
        let targets = self.router.emitters_for(roles, except);
        if targets.is_empty() {
            return;
        }
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let deliveries = targets.into_iter().map(|(id, emitter)| {
                let event = event.clone();
                async move { (id, emitter.emit_with_ack(event).await) }
            });
            for (id, result) in futures_util::future::join_all(deliveries).await {
                if let Err(e) = result {
                    warn!("delivery to {id} failed, disconnecting: {e}");
                    let _ = commands.send(SessionCommand::Disconnect { id }).await;
                }
            }
        });
    }
}
