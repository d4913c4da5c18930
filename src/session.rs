use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::names::DirectoryNames;
use crate::pty::Pty;
use crate::tail::TailBuffer;

/// Identifier of a live session. Allocated from a monotonic counter starting
/// at 1 and never reused within one host process.
pub type SessionId = u64;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Output-side state of a session: the tail and the last-output time.
///
/// Handed to the PTY reader thread on its own so the reader does not keep
/// the session's input channel or PTY master alive.
#[derive(Clone)]
pub struct OutputSink {
    tail: Arc<Mutex<TailBuffer>>,
    /// 0 until the first chunk arrives.
    last_output: Arc<AtomicU64>,
}

impl OutputSink {
    pub fn new(tail_capacity: usize) -> Self {
        Self {
            tail: Arc::new(Mutex::new(TailBuffer::new(tail_capacity))),
            last_output: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record an output chunk in the tail and bump the output timestamp.
    pub fn record(&self, data: &[u8]) {
        self.tail.lock().append(data);
        self.last_output.store(now_millis(), Ordering::Release);
    }

    pub fn last_output(&self) -> Option<u64> {
        match self.last_output.load(Ordering::Acquire) {
            0 => None,
            t => Some(t),
        }
    }

    /// Copy of the tail. Holds the lock only for the copy.
    pub fn snapshot(&self) -> Vec<u8> {
        self.tail.lock().snapshot()
    }
}

/// A live, process-backed session.
///
/// Cloning is cheap: all mutable state is shared behind `Arc`s, so the PTY
/// reader thread, the registry and API handlers all see the same tail and
/// liveness flags.
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    pub working_directory: PathBuf,
    /// PID of the child process spawned in the PTY, if available.
    pub pid: Option<u32>,
    pub output: OutputSink,
    pub input_tx: mpsc::Sender<Bytes>,
    pub pty: Option<Arc<Mutex<Pty>>>,
    /// Set by the exit monitor once the child has been reaped. Checked before
    /// signaling so a recycled PID is never hit.
    pub child_exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("working_directory", &self.working_directory)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build a session that is not (yet) attached to a process.
    pub fn new(
        id: SessionId,
        working_directory: PathBuf,
        tail_capacity: usize,
        input_tx: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            id,
            working_directory,
            pid: None,
            output: OutputSink::new(tail_capacity),
            input_tx,
            pty: None,
            child_exited: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_process(mut self, pty: Pty, pid: Option<u32>) -> Self {
        self.pty = Some(Arc::new(Mutex::new(pty)));
        self.pid = pid;
        self
    }

    pub fn last_output(&self) -> Option<u64> {
        self.output.last_output()
    }

    pub fn tail_snapshot(&self) -> Vec<u8> {
        self.output.snapshot()
    }

    /// Queue input for the PTY writer without waiting.
    ///
    /// Returns `false` if the input was dropped because the writer is gone
    /// or its queue is full.
    pub fn write(&self, data: Bytes) -> bool {
        match self.input_tx.try_send(data) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session = self.id, "input queue full, dropping write");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(session = self.id, "input channel closed, dropping write");
                false
            }
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        if let Some(pty) = &self.pty {
            if let Err(e) = pty.lock().resize(cols, rows) {
                tracing::warn!(session = self.id, ?e, "failed to resize PTY");
            }
        }
    }

    /// Send SIGKILL to the child's process group.
    pub fn kill_child(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGKILL);
    }

    /// Send SIGHUP to the child's process group, asking it to exit.
    pub fn send_sighup(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGHUP);
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) {
        let Some(pid) = self.pid else { return };
        if self.child_exited.load(Ordering::Acquire) {
            tracing::debug!(session = self.id, pid, "child already exited, skipping signal");
            return;
        }
        crate::pty::signal_group(pid, signal);
    }
}

/// A remembered working directory with no process behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ghost {
    pub working_directory: PathBuf,
}

/// Either a live session or a ghost; the registry never mixes the two.
#[derive(Debug, Clone)]
pub enum SessionState {
    Live(Session),
    Ghost(Ghost),
}

impl SessionState {
    pub fn working_directory(&self) -> &Path {
        match self {
            SessionState::Live(s) => &s.working_directory,
            SessionState::Ghost(g) => &g.working_directory,
        }
    }
}

/// Identifier of an entry in [`SessionRegistry::list_all`].
///
/// Ghosts are addressed by their position in the ghost list, a namespace
/// disjoint from live session ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryId {
    Live { id: SessionId },
    Ghost { index: usize },
}

/// One row of the session list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionListing {
    pub id: EntryId,
    pub working_directory: PathBuf,
    pub title: String,
    pub ghost: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<u64>,
}

/// Where an exiting session came from, as returned by
/// [`SessionRegistry::finish_exit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitedSession {
    pub working_directory: PathBuf,
    /// `true` if the session was still live (it exited on its own), `false`
    /// if it had already been removed by a kill.
    pub was_live: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("maximum number of sessions reached ({0})")]
    LimitReached(usize),
    #[error("session id already registered: {0}")]
    IdInUse(SessionId),
    #[error("shutting down, not accepting new sessions")]
    ShuttingDown,
}

struct RegistryInner {
    live: HashMap<SessionId, Session>,
    order: Vec<SessionId>,
    ghosts: Vec<Ghost>,
    /// Killed sessions whose exit has not been observed yet.
    pending_exit: HashMap<SessionId, PathBuf>,
    next_id: SessionId,
    max_sessions: Option<usize>,
    /// Set by `drain`; no session is registered afterwards.
    closed: bool,
}

/// Owns the live sessions, the ghost list and the display order.
///
/// Every mutation happens under one write lock, so id allocation, the order
/// index and exit bookkeeping are each updated atomically. No I/O is done
/// while the lock is held.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_max_sessions(None)
    }

    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                live: HashMap::new(),
                order: Vec::new(),
                ghosts: Vec::new(),
                pending_exit: HashMap::new(),
                next_id: 1,
                max_sessions,
                closed: false,
            })),
        }
    }

    /// Reserve the next session id. Ids reserved for spawns that later fail
    /// are simply never used.
    pub fn allocate_id(&self) -> SessionId {
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// **Advisory** capacity check, used to skip a pointless fork/exec. The
    /// authoritative check is in [`SessionRegistry::insert`].
    pub fn check_capacity(&self) -> Result<(), RegistryError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(RegistryError::ShuttingDown);
        }
        match inner.max_sessions {
            Some(max) if inner.live.len() >= max => Err(RegistryError::LimitReached(max)),
            _ => Ok(()),
        }
    }

    /// Register a live session and append it to the display order.
    pub fn insert(&self, session: Session) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(RegistryError::ShuttingDown);
        }
        if let Some(max) = inner.max_sessions {
            if inner.live.len() >= max {
                return Err(RegistryError::LimitReached(max));
            }
        }
        let id = session.id;
        if inner.live.contains_key(&id) || inner.pending_exit.contains_key(&id) {
            return Err(RegistryError::IdInUse(id));
        }
        if id >= inner.next_id {
            inner.next_id = id + 1;
        }
        inner.live.insert(id, session);
        inner.order.push(id);
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.inner.read().live.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a live session because it is being killed.
    ///
    /// The session leaves the live map and the order immediately but is kept
    /// as pending-exit, so the exit monitor can still produce its exit record
    /// through [`SessionRegistry::finish_exit`].
    pub fn remove_for_kill(&self, id: SessionId) -> Option<Session> {
        let mut inner = self.inner.write();
        let session = inner.live.remove(&id)?;
        inner.order.retain(|&o| o != id);
        inner
            .pending_exit
            .insert(id, session.working_directory.clone());
        Some(session)
    }

    /// Account for the exit of session `id`, exactly once.
    ///
    /// Removes it from the live set (spontaneous exit) or from the
    /// pending-exit set (after a kill). Returns `None` if the exit was already
    /// accounted for or the id was never registered.
    pub fn finish_exit(&self, id: SessionId) -> Option<ExitedSession> {
        let mut inner = self.inner.write();
        if let Some(session) = inner.live.remove(&id) {
            inner.order.retain(|&o| o != id);
            return Some(ExitedSession {
                working_directory: session.working_directory,
                was_live: true,
            });
        }
        inner
            .pending_exit
            .remove(&id)
            .map(|working_directory| ExitedSession {
                working_directory,
                was_live: false,
            })
    }

    /// Current display order of live sessions.
    pub fn order(&self) -> Vec<SessionId> {
        let inner = self.inner.read();
        ordered_ids(&inner)
    }

    /// Replace the display order.
    ///
    /// Ids that are no longer live (or never were) are dropped silently, as
    /// are duplicates. Live ids the request left out keep their relative
    /// order and go to the end, so the order always covers the live set.
    pub fn reorder(&self, ids: &[SessionId]) {
        let mut inner = self.inner.write();
        let mut seen = HashSet::new();
        let mut order: Vec<SessionId> = ids
            .iter()
            .copied()
            .filter(|id| inner.live.contains_key(id) && seen.insert(*id))
            .collect();
        let omitted: Vec<SessionId> = ordered_ids(&inner)
            .into_iter()
            .filter(|id| !seen.contains(id))
            .collect();
        order.extend(omitted);
        inner.order = order;
    }

    pub fn ghosts(&self) -> Vec<Ghost> {
        self.inner.read().ghosts.clone()
    }

    pub fn add_ghost(&self, working_directory: PathBuf) {
        self.inner.write().ghosts.push(Ghost { working_directory });
    }

    /// Put a ghost back at `index` (clamped to the end of the list).
    pub fn insert_ghost(&self, index: usize, ghost: Ghost) {
        let mut inner = self.inner.write();
        let index = index.min(inner.ghosts.len());
        inner.ghosts.insert(index, ghost);
    }

    /// Remove the ghost at `index`. Out-of-range indices are a no-op.
    pub fn remove_ghost(&self, index: usize) -> Option<Ghost> {
        let mut inner = self.inner.write();
        if index < inner.ghosts.len() {
            Some(inner.ghosts.remove(index))
        } else {
            None
        }
    }

    /// Empty the ghost list, returning what it held.
    pub fn take_ghosts(&self) -> Vec<Ghost> {
        std::mem::take(&mut self.inner.write().ghosts)
    }

    /// All entries in display order: live sessions first, then ghosts.
    pub fn states(&self) -> Vec<SessionState> {
        let inner = self.inner.read();
        let mut states: Vec<SessionState> = ordered_ids(&inner)
            .into_iter()
            .filter_map(|id| inner.live.get(&id).cloned().map(SessionState::Live))
            .collect();
        states.extend(inner.ghosts.iter().cloned().map(SessionState::Ghost));
        states
    }

    /// The session list as shown to users, titles resolved through `names`.
    pub fn list_all(&self, names: &DirectoryNames) -> Vec<SessionListing> {
        let mut ghost_index = 0;
        self.states()
            .into_iter()
            .map(|state| match state {
                SessionState::Live(s) => SessionListing {
                    id: EntryId::Live { id: s.id },
                    title: names.resolve(&s.working_directory),
                    last_output: s.last_output(),
                    working_directory: s.working_directory,
                    ghost: false,
                },
                SessionState::Ghost(g) => {
                    let index = ghost_index;
                    ghost_index += 1;
                    SessionListing {
                        id: EntryId::Ghost { index },
                        title: names.resolve(&g.working_directory),
                        working_directory: g.working_directory,
                        ghost: true,
                        last_output: None,
                    }
                }
            })
            .collect()
    }

    /// Live sessions in display order.
    pub fn live_sessions(&self) -> Vec<Session> {
        self.states()
            .into_iter()
            .filter_map(|state| match state {
                SessionState::Live(s) => Some(s),
                SessionState::Ghost(_) => None,
            })
            .collect()
    }

    /// Directories to persist: live sessions in order, then ghosts.
    pub fn saved_directories(&self) -> Vec<PathBuf> {
        self.states()
            .iter()
            .map(|s| s.working_directory().to_path_buf())
            .collect()
    }

    /// Remove every live session at once, for shutdown. Later inserts fail
    /// with [`RegistryError::ShuttingDown`].
    pub fn drain(&self) -> Vec<Session> {
        let mut inner = self.inner.write();
        inner.closed = true;
        let ids = ordered_ids(&inner);
        inner.order.clear();
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = inner.live.remove(&id) {
                inner
                    .pending_exit
                    .insert(id, session.working_directory.clone());
                drained.push(session);
            }
        }
        drained
    }
}

/// Order index restricted to live ids, with any live id missing from it
/// appended in ascending id order.
fn ordered_ids(inner: &RegistryInner) -> Vec<SessionId> {
    let mut seen = HashSet::new();
    let mut ids: Vec<SessionId> = inner
        .order
        .iter()
        .copied()
        .filter(|id| inner.live.contains_key(id) && seen.insert(*id))
        .collect();
    let mut missing: Vec<SessionId> = inner
        .live
        .keys()
        .copied()
        .filter(|id| !seen.contains(id))
        .collect();
    missing.sort_unstable();
    ids.extend(missing);
    ids
}
