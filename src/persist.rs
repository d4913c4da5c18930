//! Best-effort persistence of session directories, favorites and names.
//!
//! Three independent JSON records live in the data directory:
//!
//! - `sessions.json`: `[{"working_directory": ...}]`, live sessions in display
//!   order followed by ghosts
//! - `favorites.json`: same shape
//! - `names.json`: `{ "<directory>": "<display name>" }`
//!
//! Persisted state is a cache of intent. Loading tolerates missing or
//! malformed files (each record independently degrades to empty) and write
//! failures are logged, never propagated to the mutation that caused them.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

const SESSIONS_FILE: &str = "sessions.json";
const FAVORITES_FILE: &str = "favorites.json";
const NAMES_FILE: &str = "names.json";

/// Full logical state written on every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Live sessions in order, then ghosts.
    pub sessions: Vec<PathBuf>,
    pub favorites: Vec<PathBuf>,
    pub names: HashMap<PathBuf, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirectoryRecord {
    working_directory: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to write {}: {}", .0.display(), .1)]
    Write(PathBuf, #[source] io::Error),
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Reads and writes the persisted records in one directory.
#[derive(Debug, Clone)]
pub struct PersistenceStore {
    dir: PathBuf,
}

impl PersistenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load all records. Never fails: anything unreadable is treated as absent.
    pub fn load(&self) -> Snapshot {
        let sessions: Vec<DirectoryRecord> = read_record(&self.dir.join(SESSIONS_FILE));
        let favorites: Vec<DirectoryRecord> = read_record(&self.dir.join(FAVORITES_FILE));
        let names: BTreeMap<String, String> = read_record(&self.dir.join(NAMES_FILE));
        Snapshot {
            sessions: sessions.into_iter().map(|r| r.working_directory).collect(),
            favorites: favorites.into_iter().map(|r| r.working_directory).collect(),
            names: names
                .into_iter()
                .map(|(dir, name)| (PathBuf::from(dir), name))
                .collect(),
        }
    }

    /// Write all records atomically (each via temp file + rename).
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), PersistError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PersistError::Write(self.dir.clone(), e))?;

        let sessions = directory_records(&snapshot.sessions, SESSIONS_FILE);
        let favorites = directory_records(&snapshot.favorites, FAVORITES_FILE);
        let names: BTreeMap<&str, &String> = snapshot
            .names
            .iter()
            .filter_map(|(dir, name)| match dir.to_str() {
                Some(key) => Some((key, name)),
                None => {
                    tracing::warn!(path = %dir.display(), "skipping name of non-UTF-8 directory");
                    None
                }
            })
            .collect();

        write_record(&self.dir.join(SESSIONS_FILE), &sessions)?;
        write_record(&self.dir.join(FAVORITES_FILE), &favorites)?;
        write_record(&self.dir.join(NAMES_FILE), &names)?;
        Ok(())
    }
}

/// JSON can only hold UTF-8 paths; anything else is left out of `file`.
fn directory_records(dirs: &[PathBuf], file: &str) -> Vec<DirectoryRecord> {
    dirs.iter()
        .filter(|d| {
            let valid = d.to_str().is_some();
            if !valid {
                tracing::warn!(path = %d.display(), file, "skipping non-UTF-8 directory");
            }
            valid
        })
        .map(|d| DirectoryRecord {
            working_directory: d.clone(),
        })
        .collect()
}

fn read_record<T: DeserializeOwned + Default>(path: &Path) -> T {
    let contents = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), ?e, "failed to read persisted state, starting empty");
            return T::default();
        }
    };
    match serde_json::from_slice(&contents) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "malformed persisted state, starting empty");
            T::default()
        }
    }
}

fn write_record<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).map_err(|e| PersistError::Write(tmp.clone(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| PersistError::Write(path.to_path_buf(), e))
}

enum Command {
    Save(Snapshot),
    Flush(oneshot::Sender<()>),
}

/// Asynchronous, debounced writer in front of a [`PersistenceStore`].
///
/// `schedule` only enqueues. The background task waits for the debounce
/// window to pass, keeps the newest snapshot and writes it on the blocking
/// pool, so bursts of mutations cost a single write.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
    /// Held while a snapshot is taken and queued, so snapshots reach the
    /// writer in the order they were taken.
    enqueue: Arc<Mutex<()>>,
}

impl Persister {
    /// Start the writer task. Must be called within a tokio runtime.
    pub fn spawn(store: PersistenceStore, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::new(store), debounce, rx));
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            enqueue: Arc::new(Mutex::new(())),
        }
    }

    /// Take a snapshot with `take` and queue it for writing. Ignored after
    /// [`Persister::close`].
    ///
    /// `take` runs under the enqueue lock: the last snapshot queued is
    /// always the most recent one taken.
    pub fn schedule(&self, take: impl FnOnce() -> Snapshot) {
        let _guard = self.enqueue.lock();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.tx.send(Command::Save(take())).is_err() {
            tracing::debug!("persistence writer gone, dropping snapshot");
        }
    }

    /// Write any pending snapshot now and wait for it to hit the disk.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop accepting snapshots. Used at shutdown so the final state is not
    /// overwritten while sessions are being torn down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

}

async fn run_writer(
    store: Arc<PersistenceStore>,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut pending: Option<Snapshot> = None;
    let mut acks: Vec<oneshot::Sender<()>> = Vec::new();
    let mut open = true;

    while open {
        match rx.recv().await {
            Some(Command::Save(s)) => pending = Some(s),
            Some(Command::Flush(ack)) => acks.push(ack),
            None => open = false,
        }

        if open && acks.is_empty() {
            let deadline = tokio::time::Instant::now() + debounce;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    cmd = rx.recv() => match cmd {
                        Some(Command::Save(s)) => pending = Some(s),
                        Some(Command::Flush(ack)) => {
                            acks.push(ack);
                            break;
                        }
                        None => {
                            open = false;
                            break;
                        }
                    },
                }
            }
        }

        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Save(s) => pending = Some(s),
                Command::Flush(ack) => acks.push(ack),
            }
        }

        if let Some(snapshot) = pending.take() {
            let writer = store.clone();
            match tokio::task::spawn_blocking(move || writer.save(&snapshot)).await {
                Ok(Ok(())) => tracing::debug!(dir = %store.dir().display(), "persisted session state"),
                Ok(Err(e)) => tracing::warn!(%e, "failed to persist session state"),
                Err(e) => tracing::error!(?e, "persistence task panicked"),
            }
        }
        for ack in acks.drain(..) {
            let _ = ack.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let mut names = HashMap::new();
        names.insert(PathBuf::from("/tmp/a"), "Alpha".to_string());
        Snapshot {
            sessions: vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")],
            favorites: vec![PathBuf::from("/srv")],
            names,
        }
    }

    #[test]
    fn load_from_empty_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("missing"));
        assert_eq!(store.load(), Snapshot::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        store.save(&sample()).unwrap();
        assert_eq!(store.load(), sample());
        assert!(!dir.path().join("sessions.json.tmp").exists());
    }

    #[test]
    fn on_disk_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        store.save(&sample()).unwrap();
        let sessions: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("sessions.json")).unwrap())
                .unwrap();
        assert_eq!(sessions[0]["working_directory"], "/tmp/a");
        let names: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("names.json")).unwrap())
                .unwrap();
        assert_eq!(names["/tmp/a"], "Alpha");
    }

    #[test]
    fn malformed_record_degrades_independently() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        store.save(&sample()).unwrap();
        std::fs::write(dir.path().join("favorites.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("names.json"), b"[1, 2, 3]").unwrap();

        let loaded = store.load();
        assert_eq!(loaded.sessions, sample().sessions);
        assert!(loaded.favorites.is_empty());
        assert!(loaded.names.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn save_into_unwritable_location_errors() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        // A regular file where the directory should be.
        let store = PersistenceStore::new(blocker.join("sub"));
        assert!(matches!(
            store.save(&sample()),
            Err(PersistError::Write(..))
        ));
    }

    #[tokio::test]
    async fn persister_coalesces_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        let persister = Persister::spawn(store.clone(), Duration::from_secs(60));

        persister.schedule(|| Snapshot {
            sessions: vec![PathBuf::from("/first")],
            ..Default::default()
        });
        persister.schedule(sample);
        // Debounce is long; flush must force the write of the newest snapshot.
        persister.flush().await;

        assert_eq!(store.load(), sample());
    }

    #[tokio::test]
    async fn persister_writes_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        let persister = Persister::spawn(store.clone(), Duration::from_millis(10));
        persister.schedule(sample);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.load() != sample() {
            assert!(tokio::time::Instant::now() < deadline, "snapshot never written");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn closed_persister_ignores_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        let persister = Persister::spawn(store.clone(), Duration::from_millis(1));
        persister.schedule(sample);
        persister.flush().await;

        persister.close();
        persister.schedule(|| panic!("snapshot taken after close"));
        persister.flush().await;

        assert_eq!(store.load(), sample());
    }

    #[tokio::test]
    async fn write_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let persister = Persister::spawn(
            PersistenceStore::new(blocker.join("sub")),
            Duration::from_millis(1),
        );
        persister.schedule(sample);
        // Completes without panicking; the error is only logged.
        persister.flush().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_schedules_end_with_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        let persister = Persister::spawn(store.clone(), Duration::from_millis(1));
        let state = Arc::new(Mutex::new(Vec::<PathBuf>::new()));

        std::thread::scope(|scope| {
            for t in 0..8 {
                let persister = persister.clone();
                let state = state.clone();
                scope.spawn(move || {
                    for i in 0..50 {
                        let mut dirs = state.lock();
                        if i % 3 == 2 {
                            dirs.pop();
                        } else {
                            dirs.push(PathBuf::from(format!("/t{t}/{i}")));
                        }
                        drop(dirs);
                        persister.schedule(|| Snapshot {
                            sessions: state.lock().clone(),
                            ..Default::default()
                        });
                    }
                });
            }
        });
        persister.flush().await;

        assert_eq!(store.load().sessions, *state.lock());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_directories_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path());
        let odd = PathBuf::from(OsStr::from_bytes(b"/tmp/caf\xe9"));
        let mut snapshot = sample();
        snapshot.sessions.push(odd.clone());
        snapshot.favorites.push(odd.clone());
        snapshot.names.insert(odd, "Odd".to_string());

        store.save(&snapshot).unwrap();
        assert_eq!(store.load(), sample());
    }
}
