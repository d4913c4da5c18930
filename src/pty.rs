use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtyPair, PtySize};
use thiserror::Error;

/// Initial geometry of every new session.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// What to run inside a new PTY.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub shell: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnSpec {
    pub fn new(shell: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            cwd: cwd.into(),
            env: Vec::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(&self.cwd);
        cmd.env(
            "TERM",
            std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
        );
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

/// The master side of a PTY whose slave side runs the child process.
///
/// The slave fd is closed right after spawning so that readers see EOF once
/// the child (and anything it forked) exits.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl Pty {
    pub fn spawn(spec: &SpawnSpec) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let PtyPair { master, slave } = pty_system
            .openpty(size(spec.rows, spec.cols))
            .map_err(PtyError::OpenPty)?;
        let child = slave
            .spawn_command(spec.command())
            .map_err(PtyError::SpawnCommand)?;
        drop(slave);
        Ok(Self {
            master,
            child: Some(child),
        })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Take ownership of the child handle so it can be waited on elsewhere.
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(size(rows.max(1), cols.max(1)))
            .map_err(PtyError::Resize)
    }
}

fn size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// portable_pty calls setsid() when spawning, so the child leads its own
/// group and sub-processes started by the shell receive the signal too.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: libc::c_int) {
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return;
    }
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_spec_defaults_to_80x24() {
        let spec = SpawnSpec::new("/bin/sh", "/tmp").env("A", "1");
        assert_eq!((spec.cols, spec.rows), (80, 24));
        assert_eq!(spec.env, vec![("A".to_string(), "1".to_string())]);
    }

    #[test]
    fn spawn_missing_shell_fails() {
        let spec = SpawnSpec::new("/definitely/not/a/shell", "/");
        assert!(Pty::spawn(&spec).is_err());
    }

    #[test]
    fn spawn_and_exit() {
        let spec = SpawnSpec::new("/bin/sh", "/");
        let mut pty = Pty::spawn(&spec).expect("spawn /bin/sh");
        let mut writer = pty.take_writer().expect("writer");
        let mut child = pty.take_child().expect("child");
        assert!(pty.take_child().is_none());
        writer.write_all(b"exit 7\n").unwrap();
        let status = child.wait().expect("wait");
        assert_eq!(status.exit_code(), 7);
    }
}
