use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

/// Display names keyed by working directory.
///
/// A name belongs to the directory, not to any session: every live session,
/// ghost, favorite and exit record for a directory resolves its title here,
/// so a rename is visible everywhere at once.
#[derive(Clone, Default)]
pub struct DirectoryNames {
    inner: Arc<RwLock<HashMap<PathBuf, String>>>,
}

impl std::fmt::Debug for DirectoryNames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryNames")
            .field("len", &self.inner.read().len())
            .finish()
    }
}

impl DirectoryNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from previously persisted mappings.
    pub fn from_map(map: HashMap<PathBuf, String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// Display name for `dir`: the stored override, or the final path segment.
    pub fn resolve(&self, dir: &Path) -> String {
        if let Some(name) = self.inner.read().get(dir) {
            return name.clone();
        }
        default_name(dir)
    }

    /// Set the display name for `dir`, replacing any previous one.
    pub fn rename(&self, dir: &Path, name: &str) {
        self.inner.write().insert(dir.to_path_buf(), name.to_string());
    }

    pub fn snapshot(&self) -> HashMap<PathBuf, String> {
        self.inner.read().clone()
    }
}

/// Last path segment, or the whole path when there is none (e.g. `/`).
pub fn default_name(dir: &Path) -> String {
    match dir.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => dir.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_falls_back_to_last_segment() {
        let names = DirectoryNames::new();
        assert_eq!(names.resolve(Path::new("/tmp/a")), "a");
        assert_eq!(names.resolve(Path::new("/home/me/project/")), "project");
    }

    #[test]
    fn resolve_root_uses_full_path() {
        let names = DirectoryNames::new();
        assert_eq!(names.resolve(Path::new("/")), "/");
    }

    #[test]
    fn rename_overrides_and_last_write_wins() {
        let names = DirectoryNames::new();
        names.rename(Path::new("/tmp/a"), "Alpha");
        assert_eq!(names.resolve(Path::new("/tmp/a")), "Alpha");
        names.rename(Path::new("/tmp/a"), "Beta");
        assert_eq!(names.resolve(Path::new("/tmp/a")), "Beta");
        assert_eq!(names.snapshot().len(), 1);
    }

    #[test]
    fn duplicate_names_across_directories_allowed() {
        let names = DirectoryNames::new();
        names.rename(Path::new("/tmp/a"), "same");
        names.rename(Path::new("/tmp/b"), "same");
        assert_eq!(names.resolve(Path::new("/tmp/a")), "same");
        assert_eq!(names.resolve(Path::new("/tmp/b")), "same");
    }

    #[test]
    fn trailing_slash_is_same_key() {
        let names = DirectoryNames::new();
        names.rename(Path::new("/tmp/a/"), "Alpha");
        assert_eq!(names.resolve(Path::new("/tmp/a")), "Alpha");
    }

    #[test]
    fn clones_share_state() {
        let names = DirectoryNames::new();
        let other = names.clone();
        other.rename(Path::new("/srv/x"), "X");
        assert_eq!(names.resolve(Path::new("/srv/x")), "X");
    }

    #[test]
    fn from_map_restores() {
        let mut map = HashMap::new();
        map.insert(PathBuf::from("/tmp/a"), "Alpha".to_string());
        let names = DirectoryNames::from_map(map);
        assert_eq!(names.resolve(Path::new("/tmp/a")), "Alpha");
    }
}
