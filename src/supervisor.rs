//! Session lifecycle: spawning children in PTYs, routing their I/O and
//! accounting for their exits.
//!
//! [`Supervisor`] is the single entry point for every session operation the
//! daemon exposes. It composes the registry, the name and favorite stores,
//! the exit history, the output broker and the persister, and it is the
//! only place that schedules persistence writes.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use portable_pty::Child;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::broker::{Broker, OutputEvent, SessionEvent};
use crate::config::{Config, RestoreMode};
use crate::favorites::Favorites;
use crate::history::{ExitHistory, ExitRecord};
use crate::names::DirectoryNames;
use crate::persist::{PersistenceStore, Persister, Snapshot};
use crate::picker::{CommandPicker, DirectoryPicker, HeadlessPicker};
use crate::pty::{Pty, PtyError, SpawnSpec};
use crate::session::{
    now_millis, OutputSink, RegistryError, Session, SessionId, SessionListing, SessionRegistry,
};

/// Path of the shared scratch directory.
pub const SCRATCH_DIR_ENV: &str = "GHOSTMUX_SCRATCH_DIR";
/// Id of the session the shell runs in.
pub const SESSION_ID_ENV: &str = "GHOSTMUX_SESSION_ID";
/// Socket of the daemon, for tools running inside a session.
pub const SOCKET_ENV: &str = "GHOSTMUX_SOCKET";

/// Pending writes per session before input is dropped.
const INPUT_CAPACITY: usize = 64;

/// Grace period between SIGHUP and SIGKILL at shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no ghost at index {0}")]
    NoSuchGhost(usize),
    #[error("spawn task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("failed to start session thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// What `create_session` hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub id: SessionId,
    pub working_directory: PathBuf,
    pub title: String,
}

/// Recent output of one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTail {
    pub id: SessionId,
    pub title: String,
    pub working_directory: PathBuf,
    /// Tail bytes decoded as lossy UTF-8.
    pub tail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteEntry {
    pub working_directory: PathBuf,
    pub title: String,
}

/// Owns every session and the state around them.
///
/// Cheap to clone; clones share all state. Must be created inside a tokio
/// runtime since it starts the persistence writer.
#[derive(Clone)]
pub struct Supervisor {
    registry: SessionRegistry,
    names: DirectoryNames,
    favorites: Favorites,
    history: ExitHistory,
    broker: Broker,
    persister: Persister,
    picker: Arc<dyn DirectoryPicker>,
    config: Arc<Config>,
    socket_path: Option<PathBuf>,
}

impl Supervisor {
    /// Load persisted state from the configured data directory.
    ///
    /// Saved sessions come back as ghosts. With `restore = "resume"` call
    /// [`Supervisor::restore`] afterwards to respawn them.
    pub fn new(config: Config) -> Self {
        let store = PersistenceStore::new(config.data_dir());
        let saved = store.load();
        let persister = Persister::spawn(store, config.persist_debounce());

        let registry = SessionRegistry::with_max_sessions(Some(config.max_sessions));
        for dir in saved.sessions {
            registry.add_ghost(dir);
        }

        let picker: Arc<dyn DirectoryPicker> = match config.picker.clone().and_then(CommandPicker::new)
        {
            Some(picker) => Arc::new(picker),
            None => Arc::new(HeadlessPicker),
        };

        tracing::debug!(
            ghosts = registry.ghosts().len(),
            favorites = saved.favorites.len(),
            names = saved.names.len(),
            "loaded persisted state"
        );

        Self {
            registry,
            names: DirectoryNames::from_map(saved.names),
            favorites: Favorites::from_list(saved.favorites),
            history: ExitHistory::new(config.exit_history),
            broker: Broker::new(),
            persister,
            picker,
            config: Arc::new(config),
            socket_path: None,
        }
    }

    /// Advertise `path` to sessions as [`SOCKET_ENV`].
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    pub fn with_picker(mut self, picker: Arc<dyn DirectoryPicker>) -> Self {
        self.picker = picker;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Apply the configured restore mode to the ghosts loaded at startup.
    pub async fn restore(&self) {
        if self.config.restore != RestoreMode::Resume {
            return;
        }
        let ghosts = self.registry.take_ghosts();
        if ghosts.is_empty() {
            return;
        }
        tracing::info!(count = ghosts.len(), "resuming saved sessions");
        for ghost in ghosts {
            let dir = ghost.working_directory.clone();
            if let Err(e) = self.create_session(Some(dir)).await {
                tracing::warn!(
                    path = %ghost.working_directory.display(),
                    error = %e,
                    "failed to resume session, keeping it as a ghost"
                );
                self.registry.add_ghost(ghost.working_directory);
            }
        }
        self.persist();
    }

    /// Ask the configured picker for a directory.
    pub async fn select_working_directory(&self) -> Option<PathBuf> {
        self.picker.pick().await
    }

    /// Spawn a session on the blocking pool.
    pub async fn create_session(
        &self,
        working_directory: Option<PathBuf>,
    ) -> Result<SessionDescriptor, SpawnError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.spawn(working_directory)).await?
    }

    /// Spawn a shell in a new PTY and register it as a live session.
    ///
    /// Blocks on fork/exec; async callers should go through
    /// [`Supervisor::create_session`]. Each session gets three dedicated
    /// threads (exit monitor, PTY reader, PTY writer) that live as long as
    /// the child.
    pub fn spawn(&self, working_directory: Option<PathBuf>) -> Result<SessionDescriptor, SpawnError> {
        self.registry.check_capacity()?;
        let cwd = resolve_working_directory(working_directory);
        let id = self.registry.allocate_id();

        let scratch = self.config.scratch_dir();
        if let Err(e) = std::fs::create_dir_all(&scratch) {
            tracing::warn!(path = %scratch.display(), ?e, "failed to create scratch directory");
        }
        let mut spec = SpawnSpec::new(self.config.shell(), &cwd)
            .env(SCRATCH_DIR_ENV, scratch.display().to_string())
            .env(SESSION_ID_ENV, id.to_string());
        if let Some(socket) = &self.socket_path {
            spec = spec.env(SOCKET_ENV, socket.display().to_string());
        }

        let mut pty = Pty::spawn(&spec)?;
        let reader = pty.take_reader()?;
        let writer = pty.take_writer()?;
        let child = pty.take_child();
        let pid = child.as_ref().and_then(|c| c.process_id());

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CAPACITY);
        let session =
            Session::new(id, cwd, self.config.tail_bytes, input_tx).with_process(pty, pid);

        // Register before the exit monitor starts so an instant exit is
        // still accounted for.
        let descriptor = match self.register(session.clone()) {
            Ok(d) => d,
            Err(e) => {
                session.kill_child();
                if let Some(mut child) = child {
                    tokio::task::spawn_blocking(move || {
                        let _ = child.wait();
                    });
                }
                return Err(e);
            }
        };

        if let Err(e) = self.start_session_threads(&session, child, reader, writer, input_rx) {
            tracing::error!(session = id, %e, "failed to start session threads");
            return Err(e);
        }

        tracing::info!(
            session = id,
            path = %descriptor.working_directory.display(),
            pid,
            "session spawned"
        );
        Ok(descriptor)
    }

    fn register(&self, session: Session) -> Result<SessionDescriptor, SpawnError> {
        let descriptor = SessionDescriptor {
            id: session.id,
            title: self.names.resolve(&session.working_directory),
            working_directory: session.working_directory.clone(),
        };
        self.registry.insert(session)?;
        self.persist();
        self.broker.publish_event(SessionEvent::Created { id: descriptor.id });
        Ok(descriptor)
    }

    /// Start the exit monitor first, so a failure to start the reader or
    /// writer can fall back to a kill that the monitor then accounts for.
    fn start_session_threads(
        &self,
        session: &Session,
        child: Option<Box<dyn Child + Send + Sync>>,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        input_rx: mpsc::Receiver<Bytes>,
    ) -> Result<(), SpawnError> {
        let id = session.id;
        match child {
            Some(child) => {
                if let Err(e) = self.monitor_exit(session, child) {
                    // The child handle went down with the thread; nobody
                    // will wait on it.
                    self.kill_session(id);
                    self.on_exit(id, None);
                    return Err(e.into());
                }
            }
            None => self.on_exit(id, None),
        }

        let started = spawn_reader(id, session.output.clone(), self.broker.clone(), reader)
            .and_then(|()| spawn_writer(id, writer, input_rx));
        if let Err(e) = started {
            self.kill_session(id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Wait for the child on its own thread, then account for its exit.
    fn monitor_exit(
        &self,
        session: &Session,
        mut child: Box<dyn Child + Send + Sync>,
    ) -> std::io::Result<()> {
        let id = session.id;
        let this = self.clone();
        let child_exited = session.child_exited.clone();
        spawn_session_thread(format!("pty-exit-{id}"), id, move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                match child.wait() {
                    Ok(status) => Some(status.exit_code() as i32),
                    Err(e) => {
                        tracing::error!(session = id, ?e, "error waiting for session child");
                        None
                    }
                }
            }));
            let code = result.unwrap_or_else(|e| {
                tracing::error!(session = id, "child exit monitor task panicked: {:?}", e);
                None
            });
            // Mark the child reaped before deregistering so no later signal
            // can hit a recycled PID.
            child_exited.store(true, Ordering::Release);
            this.on_exit(id, code);
        })
    }

    /// Record output from session `id`. Unknown ids are ignored.
    pub fn on_output(&self, id: SessionId, data: Bytes) {
        match self.registry.get(id) {
            Some(session) => deliver_output(id, &session.output, &self.broker, data),
            None => tracing::debug!(session = id, "output for unknown session dropped"),
        }
    }

    /// Account for the termination of session `id`. Only the first call per
    /// session has any effect.
    pub fn on_exit(&self, id: SessionId, exit_code: Option<i32>) {
        let Some(exited) = self.registry.finish_exit(id) else {
            tracing::debug!(session = id, "exit already accounted for");
            return;
        };
        if exited.was_live {
            self.persist();
        }
        let title = self.names.resolve(&exited.working_directory);
        tracing::info!(session = id, title = %title, ?exit_code, "session exited");
        self.history.record(ExitRecord {
            id,
            title,
            exit_code,
            timestamp: now_millis(),
        });
        self.broker.publish_event(SessionEvent::Exited { id });
    }

    pub fn write_input(&self, id: SessionId, data: Bytes) {
        match self.registry.get(id) {
            Some(session) => {
                session.write(data);
            }
            None => tracing::debug!(session = id, "write to non-live session ignored"),
        }
    }

    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) {
        match self.registry.get(id) {
            Some(session) => session.resize(cols, rows),
            None => tracing::debug!(session = id, "resize of non-live session ignored"),
        }
    }

    /// SIGKILL the session and drop it from the live set right away. Its
    /// exit record is written once the monitor reaps the child.
    pub fn kill_session(&self, id: SessionId) {
        match self.registry.remove_for_kill(id) {
            Some(session) => {
                tracing::info!(session = id, pid = session.pid, "killing session");
                session.kill_child();
                self.persist();
            }
            None => tracing::debug!(session = id, "kill of non-live session ignored"),
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionListing> {
        self.registry.list_all(&self.names)
    }

    /// Forget the ghost at `index`. Returns its directory, if there was one.
    pub fn remove_ghost(&self, index: usize) -> Option<PathBuf> {
        let ghost = self.registry.remove_ghost(index)?;
        self.persist();
        Some(ghost.working_directory)
    }

    /// Turn the ghost at `index` back into a live session.
    pub async fn respawn_ghost(&self, index: usize) -> Result<SessionDescriptor, SpawnError> {
        let ghost = self
            .registry
            .remove_ghost(index)
            .ok_or(SpawnError::NoSuchGhost(index))?;
        match self.create_session(Some(ghost.working_directory.clone())).await {
            Ok(descriptor) => Ok(descriptor),
            Err(e) => {
                self.registry.insert_ghost(index, ghost);
                Err(e)
            }
        }
    }

    pub fn rename_directory(&self, path: &Path, name: &str) {
        self.names.rename(path, name);
        self.persist();
    }

    pub fn set_session_order(&self, ids: &[SessionId]) {
        self.registry.reorder(ids);
        self.persist();
    }

    pub fn session_order(&self) -> Vec<SessionId> {
        self.registry.order()
    }

    pub fn favorites(&self) -> Vec<FavoriteEntry> {
        self.favorites
            .list()
            .into_iter()
            .map(|dir| FavoriteEntry {
                title: self.names.resolve(&dir),
                working_directory: dir,
            })
            .collect()
    }

    /// Returns `false` if `path` was already a favorite.
    pub fn add_favorite(&self, path: &Path) -> bool {
        let added = self.favorites.add(path);
        if added {
            self.persist();
        }
        added
    }

    /// Returns `false` if `path` was not a favorite.
    pub fn remove_favorite(&self, path: &Path) -> bool {
        let removed = self.favorites.remove(path);
        if removed {
            self.persist();
        }
        removed
    }

    pub fn exit_history(&self) -> Vec<ExitRecord> {
        self.history.list()
    }

    /// Tails of all live sessions, in display order.
    pub fn live_session_tails(&self) -> Vec<SessionTail> {
        self.registry
            .live_sessions()
            .into_iter()
            .map(|s| SessionTail {
                id: s.id,
                title: self.names.resolve(&s.working_directory),
                tail: String::from_utf8_lossy(&s.tail_snapshot()).into_owned(),
                last_output: s.last_output(),
                working_directory: s.working_directory,
            })
            .collect()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputEvent> {
        self.broker.subscribe_output()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.broker.subscribe_events()
    }

    /// The state that would be persisted right now.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            sessions: self.registry.saved_directories(),
            favorites: self.favorites.list(),
            names: self.names.snapshot(),
        }
    }

    fn persist(&self) {
        self.persister.schedule(|| self.snapshot());
    }

    /// Wait until every scheduled write has reached the disk.
    pub async fn flush(&self) {
        self.persister.flush().await;
    }

    /// Save the final state, then hang up on every session.
    ///
    /// Live sessions are written out so they come back as ghosts on the next
    /// start. The persister is closed before the drain, so the exits that
    /// follow do not overwrite that snapshot. Returns the handle of the task
    /// that SIGKILLs stragglers after the grace period, if any session was
    /// live.
    pub async fn shutdown(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.persist();
        self.persister.flush().await;
        self.persister.close();

        let sessions = self.registry.drain();
        if sessions.is_empty() {
            return None;
        }
        tracing::info!(count = sessions.len(), "hanging up on live sessions");
        for session in &sessions {
            session.send_sighup();
        }
        Some(tokio::spawn(async move {
            tokio::time::sleep(DRAIN_GRACE).await;
            for session in &sessions {
                session.kill_child();
            }
        }))
    }
}

fn resolve_working_directory(requested: Option<PathBuf>) -> PathBuf {
    requested
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn deliver_output(id: SessionId, sink: &OutputSink, broker: &Broker, data: Bytes) {
    sink.record(&data);
    broker.publish_output(id, data);
}

/// Run `f` on a named OS thread, logging a panic instead of propagating it.
///
/// Per-session loops block for the whole life of the child, so they stay off
/// tokio's blocking pool.
fn spawn_session_thread(
    name: String,
    id: SessionId,
    f: impl FnOnce() + Send + 'static,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
                tracing::error!(session = id, thread = %name, "session thread panicked: {:?}", e);
            }
        })
        .map(drop)
}

/// PTY → tail + broadcast, until EOF.
fn spawn_reader(
    id: SessionId,
    sink: OutputSink,
    broker: Broker,
    mut reader: Box<dyn Read + Send>,
) -> std::io::Result<()> {
    spawn_session_thread(format!("pty-reader-{id}"), id, move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => deliver_output(id, &sink, &broker, Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO once the slave side is gone.
                Err(_) => break,
            }
        }
    })
}

/// Input channel → PTY, until every sender is gone or the PTY errors.
fn spawn_writer(
    id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Bytes>,
) -> std::io::Result<()> {
    spawn_session_thread(format!("pty-writer-{id}"), id, move || {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                tracing::debug!(session = id, ?e, "PTY write failed, stopping writer");
                break;
            }
        }
    })
}
