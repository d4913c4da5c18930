#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use ghostmux::broker::{OutputEvent, SessionEvent};
use ghostmux::config::Config;
use ghostmux::session::SessionId;
use ghostmux::supervisor::Supervisor;
use tokio::sync::broadcast;

/// Upper bound for anything that waits on a real shell.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Config for tests: `/bin/sh`, state under `data_dir`, near-immediate
/// persistence.
pub fn test_config(data_dir: &Path) -> Config {
    Config {
        shell: Some("/bin/sh".to_string()),
        data_dir: Some(data_dir.to_path_buf()),
        persist_debounce_ms: 1,
        ..Config::default()
    }
}

/// Create `root/name` and return it.
pub fn make_dir(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Collect output of session `id` until it contains `needle`.
pub async fn wait_for_output(
    rx: &mut broadcast::Receiver<OutputEvent>,
    id: SessionId,
    needle: &str,
) -> String {
    let mut seen = String::new();
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(ev) if ev.id == id => {
                    seen.push_str(&String::from_utf8_lossy(&ev.data));
                    if seen.contains(needle) {
                        return;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("output channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}, saw {:?}", needle, seen));
    seen
}

/// Wait until session `id` has exited.
pub async fn wait_for_exit(rx: &mut broadcast::Receiver<SessionEvent>, id: SessionId) {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Exited { id: exited }) if exited == id => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for session {} to exit", id));
}

/// Start a socket server for `supervisor` on `socket_path` and wait for it
/// to accept connections.
pub async fn start_server(
    supervisor: Supervisor,
    socket_path: &Path,
) -> tokio_util::sync::CancellationToken {
    let cancel = tokio_util::sync::CancellationToken::new();
    let server_cancel = cancel.clone();
    let path = socket_path.to_path_buf();
    tokio::spawn(async move {
        ghostmux::server::serve(supervisor, &path, server_cancel)
            .await
            .unwrap();
    });

    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(socket_path.exists(), "server socket should exist at {:?}", socket_path);
    cancel
}
