use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

/// Directories marked for quick access, in the order they were added.
///
/// Independent of session liveness and of display names.
#[derive(Clone, Default, Debug)]
pub struct Favorites {
    inner: Arc<RwLock<Vec<PathBuf>>>,
}

impl Favorites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from persisted entries, dropping duplicates.
    pub fn from_list(list: Vec<PathBuf>) -> Self {
        let favorites = Self::new();
        for dir in list {
            favorites.add(&dir);
        }
        favorites
    }

    /// Add `dir`. Returns `false` if it was already a favorite.
    pub fn add(&self, dir: &Path) -> bool {
        let mut inner = self.inner.write();
        if inner.iter().any(|d| d == dir) {
            return false;
        }
        inner.push(dir.to_path_buf());
        true
    }

    /// Remove `dir`. Returns `false` if it was not a favorite.
    pub fn remove(&self, dir: &Path) -> bool {
        let mut inner = self.inner.write();
        let before = inner.len();
        inner.retain(|d| d != dir);
        inner.len() != before
    }

    pub fn list(&self) -> Vec<PathBuf> {
        self.inner.read().clone()
    }
}
