use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::history::DEFAULT_EXIT_HISTORY;
use crate::tail::DEFAULT_TAIL_BYTES;

/// Environment variable overriding the shell spawned for new sessions.
pub const SHELL_ENV: &str = "GHOSTMUX_SHELL";

/// Default upper bound on concurrently live sessions.
///
/// Each session costs a PTY pair and three blocking threads.
pub const DEFAULT_MAX_SESSIONS: usize = 256;

const DEFAULT_PERSIST_DEBOUNCE_MS: u64 = 250;

/// What to do with sessions saved by the previous run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Offer them as ghosts for the user to respawn.
    #[default]
    Ghost,
    /// Respawn them immediately.
    Resume,
}

/// Daemon configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell to spawn. Falls back to `$GHOSTMUX_SHELL`, `$SHELL`, `/bin/sh`.
    pub shell: Option<String>,
    /// Where persisted state lives.
    pub data_dir: Option<PathBuf>,
    /// Shared scratch directory advertised to sessions.
    pub scratch_dir: Option<PathBuf>,
    pub tail_bytes: usize,
    pub exit_history: usize,
    pub max_sessions: usize,
    pub persist_debounce_ms: u64,
    pub restore: RestoreMode,
    /// Command printing a chosen directory on stdout, e.g.
    /// `["zenity", "--file-selection", "--directory"]`.
    pub picker: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            data_dir: None,
            scratch_dir: None,
            tail_bytes: DEFAULT_TAIL_BYTES,
            exit_history: DEFAULT_EXIT_HISTORY,
            max_sessions: DEFAULT_MAX_SESSIONS,
            persist_debounce_ms: DEFAULT_PERSIST_DEBOUNCE_MS,
            restore: RestoreMode::Ghost,
            picker: None,
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("scratch"))
    }

    /// Resolve the interpreter for new sessions.
    pub fn shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var(SHELL_ENV).ok())
            .or_else(|| std::env::var("SHELL").ok())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    pub fn persist_debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.persist_debounce_ms)
    }
}

/// Default config file location: `<config dir>/ghostmux/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ghostmux")
        .join("config.toml")
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ghostmux")
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}
