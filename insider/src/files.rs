//! The shared working directory: file listing, the active file, uploads,
//! and change watching.
//!
//! The working directory is also the shell's cwd, so files change under
//! us whenever the host runs something. The watcher coalesces change
//! bursts into single notifications; the session then re-reads state and
//! rebroadcasts only what actually differs.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use log::debug;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// File store errors.
#[derive(Debug)]
pub enum FileError {
    Io(std::io::Error),
    /// A client-supplied name tried to escape the working directory.
    InvalidPath(String),
    Watch(String),
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "file io error: {e}"),
            Self::InvalidPath(name) => write!(f, "invalid file name: {name}"),
            Self::Watch(e) => write!(f, "watch error: {e}"),
        }
    }
}

impl std::error::Error for FileError {}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The room's file set, rooted at the working directory.
pub struct FileStore {
    work_dir: PathBuf,
    active_path: String,
}

impl FileStore {
    /// Open the store, creating the working directory and the start file
    /// when absent.
    pub fn open(work_dir: &Path, start_file: &str) -> Result<Self, FileError> {
        fs::create_dir_all(work_dir)?;
        let mut store = Self {
            work_dir: work_dir.to_owned(),
            active_path: String::new(),
        };
        store.set_active(start_file)?;
        Ok(store)
    }

    pub fn active_path(&self) -> &str {
        &self.active_path
    }

    /// Switch the active file, creating it empty if missing, and return
    /// its content.
    pub fn set_active(&mut self, path: &str) -> Result<String, FileError> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            fs::write(&resolved, "")?;
            debug!("created missing file {path}");
        }
        let content = fs::read_to_string(&resolved)?;
        self.active_path = path.to_owned();
        Ok(content)
    }

    pub fn read_active(&self) -> Result<String, FileError> {
        let resolved = self.resolve(&self.active_path)?;
        Ok(fs::read_to_string(resolved)?)
    }

    pub fn persist_active(&self, content: &str) -> Result<(), FileError> {
        let resolved = self.resolve(&self.active_path)?;
        fs::write(resolved, content)?;
        Ok(())
    }

    /// Write an uploaded file into the working directory.
    pub fn store_upload(&self, name: &str, data: &[u8]) -> Result<(), FileError> {
        let resolved = self.resolve(name)?;
        fs::write(resolved, data)?;
        Ok(())
    }

    /// Sorted names of the regular files in the working directory.
    /// Dotfiles stay hidden; the shell drops plenty of those.
    pub fn available_files(&self) -> Result<Vec<String>, FileError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.work_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Map a client-supplied name to a path inside the working directory,
    /// rejecting anything absolute or upward-traversing.
    fn resolve(&self, name: &str) -> Result<PathBuf, FileError> {
        let path = Path::new(name);
        if name.is_empty()
            || !path
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(FileError::InvalidPath(name.to_owned()));
        }
        Ok(self.work_dir.join(path))
    }
}

/// Watch the working directory for changes.
///
/// Raw filesystem events are coalesced with a trailing debounce so one
/// `cargo new`-sized burst becomes one notification. The returned watcher
/// must be kept alive for as long as notifications are wanted.
pub fn watch(work_dir: &Path) -> Result<(RecommendedWatcher, mpsc::Receiver<()>), FileError> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
        if let Ok(event) = result {
            if matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                let _ = raw_tx.send(());
            }
        }
    })
    .map_err(|e| FileError::Watch(e.to_string()))?;
    watcher
        .watch(work_dir, RecursiveMode::NonRecursive)
        .map_err(|e| FileError::Watch(e.to_string()))?;

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        while raw_rx.recv().await.is_some() {
            // Swallow follow-up events until the burst goes quiet.
            while let Ok(Some(())) = tokio::time::timeout(DEBOUNCE_WINDOW, raw_rx.recv()).await {}
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });

    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_start_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), "main.txt").unwrap();
        assert_eq!(store.active_path(), "main.txt");
        assert!(dir.path().join("main.txt").exists());
        assert_eq!(store.read_active().unwrap(), "");
    }

    #[test]
    fn test_set_active_creates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path(), "main.txt").unwrap();
        let content = store.set_active("scratch.txt").unwrap();
        assert_eq!(content, "");
        assert!(dir.path().join("scratch.txt").exists());
    }

    #[test]
    fn test_set_active_reads_existing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "existing").unwrap();
        let mut store = FileStore::open(dir.path(), "main.txt").unwrap();
        assert_eq!(store.set_active("notes.txt").unwrap(), "existing");
    }

    #[test]
    fn test_persist_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), "main.txt").unwrap();
        store.persist_active("fn main() {}\n").unwrap();
        assert_eq!(store.read_active().unwrap(), "fn main() {}\n");
    }

    #[test]
    fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path(), "main.txt").unwrap();
        for bad in ["../escape.txt", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(store.set_active(bad), Err(FileError::InvalidPath(_))),
                "{bad} should be rejected"
            );
        }
        // Active path untouched by the failures.
        assert_eq!(store.active_path(), "main.txt");
    }

    #[test]
    fn test_available_files_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), "b.txt").unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();
        fs::write(dir.path().join(".hidden"), "").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        assert_eq!(store.available_files().unwrap(), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_upload_appears_in_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), "main.txt").unwrap();
        store.store_upload("data.csv", b"1,2,3").unwrap();
        assert!(store
            .available_files()
            .unwrap()
            .contains(&"data.csv".to_owned()));
        assert_eq!(fs::read(dir.path().join("data.csv")).unwrap(), b"1,2,3");
    }

    #[tokio::test]
    async fn test_watch_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (_watcher, mut rx) = watch(dir.path()).unwrap();

        fs::write(dir.path().join("new.txt"), "hello").unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change notification")
            .expect("watch channel closed");
    }
}
