//! Shared pseudo-terminal bridged into the room.
//!
//! One shell process runs per room inside a PTY. Output chunks fan out to
//! the session over a broadcast channel, and the most recent "screenful"
//! is kept so a joining client can render the prompt immediately instead
//! of an empty terminal. Input goes the other way, host-gated by the
//! session, not here.
//!
//! The shell is supervised: when it exits (host typed `exit`, crash), a
//! fresh one is spawned in the same working directory.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};
use tokio::sync::broadcast;

const COLS: u16 = 80;
const ROWS: u16 = 24;
const RESPAWN_DELAY: Duration = Duration::from_millis(250);

/// Terminal errors.
#[derive(Debug, Clone)]
pub enum TerminalError {
    Spawn(String),
    Io(String),
}

impl std::fmt::Display for TerminalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to spawn shell: {e}"),
            Self::Io(e) => write!(f, "terminal io error: {e}"),
        }
    }
}

impl std::error::Error for TerminalError {}

struct Inner {
    /// Rolling replay buffer: a chunk ending in a newline starts a fresh
    /// buffer, a partial chunk (prompt, mid-line typing) is appended.
    last_chunk: Mutex<String>,
    output: broadcast::Sender<String>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// Set when the bridge is dropped; stops the supervision loop instead
    /// of respawning the shell.
    shutdown: AtomicBool,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
}

impl Inner {
    fn push_chunk(&self, chunk: String) {
        {
            let mut last = self.last_chunk.lock().unwrap_or_else(|e| e.into_inner());
            if chunk.ends_with('\n') {
                *last = chunk.clone();
            } else {
                last.push_str(&chunk);
            }
        }
        // No subscribers is fine; the buffer above still advances.
        let _ = self.output.send(chunk);
    }
}

/// Handle to the room's supervised shell.
pub struct TerminalBridge {
    inner: Arc<Inner>,
}

impl TerminalBridge {
    /// Spawn `shell` in `work_dir` and start the supervision thread.
    pub fn spawn(shell: &str, work_dir: &Path) -> Result<Self, TerminalError> {
        let (output, _) = broadcast::channel(256);
        let inner = Arc::new(Inner {
            last_chunk: Mutex::new(String::new()),
            output,
            writer: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            killer: Mutex::new(None),
        });

        let thread_inner = inner.clone();
        let shell = shell.to_owned();
        let work_dir = work_dir.to_owned();
        thread::Builder::new()
            .name("terminal-bridge".into())
            .spawn(move || shell_loop(thread_inner, shell, work_dir))
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;

        Ok(Self { inner })
    }

    /// Write raw input to the shell. Returns whether a shell was there to
    /// receive it; input during a respawn gap is dropped.
    pub fn write(&self, data: &str) -> bool {
        let mut writer = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match writer.as_mut() {
            Some(w) => {
                if let Err(e) = w.write_all(data.as_bytes()).and_then(|_| w.flush()) {
                    debug!("terminal write failed: {e}");
                    *writer = None;
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// The replay buffer shown to a freshly joined client.
    pub fn last_chunk(&self) -> String {
        self.inner
            .last_chunk
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Subscribe to output chunks from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.output.subscribe()
    }
}

impl Drop for TerminalBridge {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let killer = self
            .inner
            .killer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut killer) = killer {
            let _ = killer.kill();
        }
    }
}

fn shell_loop(inner: Arc<Inner>, shell: String, work_dir: PathBuf) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        match run_shell(&inner, &shell, &work_dir) {
            Ok(()) => info!("shell exited"),
            Err(e) => error!("terminal session failed: {e}"),
        }
        *inner.writer.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *inner.killer.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        info!("respawning shell");
        thread::sleep(RESPAWN_DELAY);
    }
}

fn run_shell(inner: &Arc<Inner>, shell: &str, work_dir: &Path) -> Result<(), TerminalError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: ROWS,
            cols: COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| TerminalError::Spawn(e.to_string()))?;

    let mut command = CommandBuilder::new(shell);
    command.cwd(work_dir);
    let mut child = pair
        .slave
        .spawn_command(command)
        .map_err(|e| TerminalError::Spawn(e.to_string()))?;
    drop(pair.slave);

    *inner.killer.lock().unwrap_or_else(|e| e.into_inner()) = Some(child.clone_killer());
    // Drop may have raced the spawn; a shell started after the flag went
    // up dies right here.
    if inner.shutdown.load(Ordering::SeqCst) {
        let _ = child.kill();
    }

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TerminalError::Io(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| TerminalError::Io(e.to_string()))?;
    *inner.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer);

    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => inner.push_chunk(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Err(e) => {
                debug!("terminal read ended: {e}");
                break;
            }
        }
    }

    let _ = child.wait();
    Ok(())
}
