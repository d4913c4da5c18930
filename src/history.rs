use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Default number of exit records kept.
pub const DEFAULT_EXIT_HISTORY: usize = 20;

/// Outcome of one terminated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub id: SessionId,
    pub title: String,
    /// `None` when the exit status could not be collected.
    pub exit_code: Option<i32>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Bounded, most-recent-first log of terminated sessions.
#[derive(Clone, Debug)]
pub struct ExitHistory {
    inner: Arc<Mutex<VecDeque<ExitRecord>>>,
    limit: usize,
}

impl Default for ExitHistory {
    fn default() -> Self {
        Self::new(DEFAULT_EXIT_HISTORY)
    }
}

impl ExitHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(limit + 1))),
            limit,
        }
    }

    /// Prepend `record`, dropping the oldest entries beyond the limit.
    pub fn record(&self, record: ExitRecord) {
        let mut inner = self.inner.lock();
        inner.push_front(record);
        inner.truncate(self.limit);
    }

    /// All records, most recent first.
    pub fn list(&self) -> Vec<ExitRecord> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
