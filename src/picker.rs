use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

pub type PickFuture<'a> = Pin<Box<dyn Future<Output = Option<PathBuf>> + Send + 'a>>;

/// Source of a user-chosen working directory for `select_working_directory`.
///
/// The dialog itself belongs to the UI; the daemon only needs an answer.
pub trait DirectoryPicker: Send + Sync {
    fn pick(&self) -> PickFuture<'_>;
}

/// Picker for headless daemons: there is nobody to ask.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessPicker;

impl DirectoryPicker for HeadlessPicker {
    fn pick(&self) -> PickFuture<'_> {
        Box::pin(async { None })
    }
}

/// Runs an external chooser (e.g. `zenity --file-selection --directory`)
/// and takes the first line of its stdout.
#[derive(Debug, Clone)]
pub struct CommandPicker {
    argv: Vec<String>,
}

impl CommandPicker {
    /// Returns `None` for an empty command line.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.is_empty() {
            None
        } else {
            Some(Self { argv })
        }
    }

    async fn run(&self) -> Option<PathBuf> {
        let output = match tokio::process::Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(std::process::Stdio::null())
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(command = %self.argv[0], ?e, "failed to run directory picker");
                return None;
            }
        };
        if !output.status.success() {
            tracing::debug!(status = ?output.status, "directory picker cancelled");
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next()?.trim();
        if line.is_empty() {
            return None;
        }
        let path = PathBuf::from(line);
        if path.is_dir() {
            Some(path)
        } else {
            tracing::debug!(path = %path.display(), "picker returned a non-directory");
            None
        }
    }
}

impl DirectoryPicker for CommandPicker {
    fn pick(&self) -> PickFuture<'_> {
        Box::pin(self.run())
    }
}
