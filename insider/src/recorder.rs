//! Event-sourced session recording.
//!
//! The recorder captures the privileged broadcast stream as timestamped
//! `(event, args)` entries. Every entry is appended to a JSON-lines crash
//! log as it happens, so a process restart loses at most the entry in
//! flight; reopening the log resumes the clock after the last recorded
//! timestamp. Finalizing packs everything into a gzip-compressed JSON
//! artifact and removes the crash log.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RoomInfo;
use crate::protocol::ServerEvent;

pub const RECORDING_VERSION: u32 = 1;

/// Recorder errors.
#[derive(Debug)]
pub enum RecorderError {
    Io(std::io::Error),
    Encode(String),
}

impl std::fmt::Display for RecorderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "recorder io error: {e}"),
            Self::Encode(e) => write!(f, "recording encode error: {e}"),
        }
    }
}

impl std::error::Error for RecorderError {}

impl From<std::io::Error> for RecorderError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// One captured event, relative to the start of the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    pub timestamp_ms: u64,
    pub event: String,
    pub args: Vec<Value>,
}

/// The finalized artifact, before compression.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub recording_version: u32,
    pub platform_version: String,
    pub room_info: RoomInfo,
    pub recording: Vec<RecordedEvent>,
}

impl Recording {
    /// Unpack a finalized artifact.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecorderError> {
        let mut decoder = GzDecoder::new(bytes);
        let mut json = Vec::new();
        decoder.read_to_end(&mut json)?;
        serde_json::from_slice(&json).map_err(|e| RecorderError::Encode(e.to_string()))
    }
}

/// Captures the session's broadcast stream into a crash-safe log.
pub struct SessionRecorder {
    events: Vec<RecordedEvent>,
    /// Clock offset carried over from a replayed crash log.
    base_ms: u64,
    started: Instant,
    log_path: PathBuf,
    log_tx: Option<mpsc::Sender<String>>,
    log_thread: Option<JoinHandle<()>>,
}

impl SessionRecorder {
    /// Open (or resume) a recorder whose crash log lives at `log_path`.
    ///
    /// An existing log is replayed line by line; corrupt lines (a torn
    /// write from a crash) are skipped. The timestamp clock resumes after
    /// the newest replayed entry so the timeline stays monotonic.
    pub fn open(log_path: &Path) -> Result<Self, RecorderError> {
        let mut events = Vec::new();
        if log_path.exists() {
            let reader = BufReader::new(File::open(log_path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RecordedEvent>(&line) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!("skipping corrupt recording log line: {e}"),
                }
            }
            if !events.is_empty() {
                debug!("resumed recording with {} replayed events", events.len());
            }
        }
        let base_ms = events.last().map(|e| e.timestamp_ms).unwrap_or(0);

        let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
        let (log_tx, log_rx) = mpsc::channel::<String>();
        let log_thread = thread::Builder::new()
            .name("recording-log".into())
            .spawn(move || {
                while let Ok(line) = log_rx.recv() {
                    if writeln!(file, "{line}").and_then(|_| file.flush()).is_err() {
                        warn!("recording log write failed, entries may be lost on crash");
                    }
                }
            })?;

        Ok(Self {
            events,
            base_ms,
            started: Instant::now(),
            log_path: log_path.to_owned(),
            log_tx: Some(log_tx),
            log_thread: Some(log_thread),
        })
    }

    /// Capture one broadcast event. Acks are transport chatter, not
    /// session history, and are never recorded.
    pub fn record(&mut self, event: &ServerEvent) {
        if matches!(event, ServerEvent::Ack(_)) {
            return;
        }
        let args = match event.to_args() {
            Ok(args) => args,
            Err(e) => {
                warn!("unrecordable event {}: {e}", event.name());
                return;
            }
        };
        let entry = RecordedEvent {
            timestamp_ms: self.base_ms + self.started.elapsed().as_millis() as u64,
            event: event.name().to_owned(),
            args,
        };
        if let (Some(tx), Ok(line)) = (&self.log_tx, serde_json::to_string(&entry)) {
            let _ = tx.send(line);
        }
        self.events.push(entry);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Flush the log, pack the artifact, and remove the crash log.
    pub fn finalize(
        mut self,
        platform_version: &str,
        room_info: RoomInfo,
    ) -> Result<Vec<u8>, RecorderError> {
        self.shutdown_log();

        let recording = Recording {
            recording_version: RECORDING_VERSION,
            platform_version: platform_version.to_owned(),
            room_info,
            recording: std::mem::take(&mut self.events),
        };
        let json =
            serde_json::to_vec(&recording).map_err(|e| RecorderError::Encode(e.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let bytes = encoder.finish()?;

        if let Err(e) = std::fs::remove_file(&self.log_path) {
            debug!("could not remove recording log: {e}");
        }
        Ok(bytes)
    }

    fn shutdown_log(&mut self) {
        drop(self.log_tx.take());
        if let Some(handle) = self.log_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        self.shutdown_log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomInfo {
        RoomInfo {
            id: "room-1".into(),
            name: "Systems interview".into(),
            room_type: "interview".into(),
            created_at: "2026-08-01T12:00:00Z".into(),
        }
    }

    #[test]
    fn test_finalize_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");

        let mut recorder = SessionRecorder::open(&log).unwrap();
        recorder.record(&ServerEvent::ActiveFilePathChanged("main.rs".into()));
        recorder.record(&ServerEvent::TerminalOutputted("$ cargo run\n".into()));

        let bytes = recorder.finalize("2.4.0", room()).unwrap();
        let recording = Recording::decode(&bytes).unwrap();

        assert_eq!(recording.recording_version, RECORDING_VERSION);
        assert_eq!(recording.platform_version, "2.4.0");
        assert_eq!(recording.room_info, room());
        assert_eq!(recording.recording.len(), 2);
        assert_eq!(recording.recording[0].event, "active-file-path-changed");
        assert_eq!(recording.recording[1].event, "terminal-outputted");
    }

    #[test]
    fn test_acks_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::open(&dir.path().join("s.log")).unwrap();
        recorder.record(&ServerEvent::Ack(5));
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_crash_log_replayed_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");

        {
            let mut recorder = SessionRecorder::open(&log).unwrap();
            recorder.record(&ServerEvent::TerminalOutputted("one\n".into()));
            recorder.record(&ServerEvent::TerminalOutputted("two\n".into()));
            // Dropped without finalize, as in a crash after the log flush.
        }

        let mut resumed = SessionRecorder::open(&log).unwrap();
        assert_eq!(resumed.len(), 2);
        resumed.record(&ServerEvent::TerminalOutputted("three\n".into()));

        let bytes = resumed.finalize("2.4.0", room()).unwrap();
        let recording = Recording::decode(&bytes).unwrap();
        assert_eq!(recording.recording.len(), 3);
        assert_eq!(recording.recording[2].event, "terminal-outputted");
    }

    #[test]
    fn test_timestamps_monotonic_across_resume() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");

        {
            let mut recorder = SessionRecorder::open(&log).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
            recorder.record(&ServerEvent::TerminalOutputted("a".into()));
        }

        let mut resumed = SessionRecorder::open(&log).unwrap();
        resumed.record(&ServerEvent::TerminalOutputted("b".into()));

        let bytes = resumed.finalize("2.4.0", room()).unwrap();
        let recording = Recording::decode(&bytes).unwrap();
        assert!(recording.recording[1].timestamp_ms >= recording.recording[0].timestamp_ms);
    }

    #[test]
    fn test_corrupt_log_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");

        let valid = serde_json::to_string(&RecordedEvent {
            timestamp_ms: 10,
            event: "terminal-outputted".into(),
            args: vec![serde_json::json!("ok")],
        })
        .unwrap();
        std::fs::write(&log, format!("{valid}\n{{\"timestampMs\": 12, \"eve")).unwrap();

        let recorder = SessionRecorder::open(&log).unwrap();
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn test_finalize_removes_crash_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");
        let mut recorder = SessionRecorder::open(&log).unwrap();
        recorder.record(&ServerEvent::TerminalOutputted("x".into()));
        recorder.finalize("2.4.0", room()).unwrap();
        assert!(!log.exists());
    }
}
