//! Unix socket server exposing the [`Supervisor`] to clients.
//!
//! A connection carries any number of request frames. Each gets a response
//! (or an error) in order, except `write_input` and `resize`. After a
//! `subscribe` request, output and lifecycle events are interleaved with
//! responses on the same connection.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc};

use crate::broker::{OutputEvent, SessionEvent};
use crate::protocol::*;
use crate::supervisor::Supervisor;

/// A client that cannot take a frame within this long is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the Unix socket server.
///
/// Runs until the `cancel` token is cancelled, then stops accepting new
/// connections. In-flight handlers finish on their own when clients leave.
pub async fn serve(
    supervisor: Supervisor,
    socket_path: &Path,
    cancel: tokio_util::sync::CancellationToken,
) -> io::Result<()> {
    // Remove a stale socket file, but only if nobody is listening on it. The
    // connect() runs on the blocking pool with a timeout since a wedged peer
    // could hang it.
    if socket_path.exists() {
        let path_owned = socket_path.to_path_buf();
        let is_active = tokio::time::timeout(
            Duration::from_secs(3),
            tokio::task::spawn_blocking(move || {
                std::os::unix::net::UnixStream::connect(&path_owned).is_ok()
            }),
        )
        .await;

        match is_active {
            Ok(Ok(true)) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("another server is already listening on {}", socket_path.display()),
                ));
            }
            _ => {
                std::fs::remove_file(socket_path)?;
            }
        }
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;

    // Restrict socket permissions to owner only (0600)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %socket_path.display(), "Unix socket server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("socket server received cancel signal, stopping accept loop");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let supervisor = supervisor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, supervisor).await {
                                tracing::debug!(?e, "client connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(?e, "failed to accept Unix socket connection");
                        // Backoff to prevent tight loop under sustained accept errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Compute the default Unix socket path for this user.
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR").filter(|d| !d.is_empty()) {
        Some(dir) => PathBuf::from(dir).join("ghostmux.sock"),
        None => PathBuf::from(format!("/tmp/ghostmux-{}", whoami())).join("ghostmux.sock"),
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Serve one client connection until it closes.
///
/// Frames are read on a separate task and handed over a channel, so the
/// main loop can wait on requests and subscription events at once without
/// cancelling a half-read frame.
async fn handle_client<S>(stream: S, supervisor: Supervisor) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (frames_tx, frames_rx) = mpsc::channel::<io::Result<Frame>>(16);
    let reader_task = tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(reader);
        loop {
            let result = Frame::read_from(&mut reader).await;
            let failed = result.is_err();
            if frames_tx.send(result).await.is_err() || failed {
                break;
            }
        }
    });

    let result = run_connection(&supervisor, frames_rx, &mut writer).await;
    reader_task.abort();
    result
}

async fn run_connection<W: AsyncWriteExt + Unpin>(
    supervisor: &Supervisor,
    mut frames_rx: mpsc::Receiver<io::Result<Frame>>,
    writer: &mut W,
) -> io::Result<()> {
    let mut output_rx: Option<broadcast::Receiver<OutputEvent>> = None;
    let mut events_rx: Option<broadcast::Receiver<SessionEvent>> = None;

    loop {
        let reply = tokio::select! {
            frame = frames_rx.recv() => {
                let frame = match frame {
                    None => return Ok(()),
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                    Some(Err(e)) => return Err(e),
                };
                let request = match parse_request(&frame) {
                    Ok(request) => request,
                    Err(err) => {
                        write_control(FrameType::Error, &err, writer).await?;
                        continue;
                    }
                };
                if matches!(request, Request::Subscribe) && output_rx.is_none() {
                    output_rx = Some(supervisor.subscribe_output());
                    events_rx = Some(supervisor.subscribe_events());
                }
                dispatch(supervisor, request).await
            }
            result = recv_or_pending(&mut output_rx) => {
                match result {
                    Ok(ev) => Some(Reply::Event(Event::from(ev))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "socket client lagged on output, dropping missed chunks");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        output_rx = None;
                        continue;
                    }
                }
            }
            result = recv_or_pending(&mut events_rx) => {
                match result {
                    Ok(ev) => Some(Reply::Event(Event::from(ev))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "socket client lagged on events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events_rx = None;
                        continue;
                    }
                }
            }
        };

        match reply {
            None => {}
            Some(Reply::Response(response)) => {
                write_control(FrameType::Response, &response, writer).await?
            }
            Some(Reply::Event(event)) => write_control(FrameType::Event, &event, writer).await?,
            Some(Reply::Error(err)) => write_control(FrameType::Error, &err, writer).await?,
        }
    }
}

enum Reply {
    Response(Response),
    Event(Event),
    Error(ErrorMsg),
}

fn parse_request(frame: &Frame) -> Result<Request, ErrorMsg> {
    if frame.frame_type != FrameType::Request {
        return Err(ErrorMsg::new(
            "unexpected_frame",
            format!("expected Request, got {:?}", frame.frame_type),
        ));
    }
    frame
        .parse_json()
        .map_err(|e| ErrorMsg::new("invalid_request", e.to_string()))
}

/// Run one request against the supervisor.
async fn dispatch(supervisor: &Supervisor, request: Request) -> Option<Reply> {
    let response = match request {
        Request::SelectWorkingDirectory => Response::Directory {
            path: supervisor.select_working_directory().await,
        },
        Request::CreateSession { working_directory } => {
            match supervisor.create_session(working_directory).await {
                Ok(session) => Response::Created { session },
                Err(e) => return Some(Reply::Error(ErrorMsg::new("spawn_failed", e.to_string()))),
            }
        }
        Request::KillSession { id } => {
            supervisor.kill_session(id);
            Response::Ok
        }
        Request::ListSessions => Response::Sessions {
            sessions: supervisor.list_sessions(),
        },
        Request::RemoveGhost { index } => Response::GhostRemoved {
            working_directory: supervisor.remove_ghost(index),
        },
        Request::RespawnGhost { index } => match supervisor.respawn_ghost(index).await {
            Ok(session) => Response::Created { session },
            Err(e) => return Some(Reply::Error(ErrorMsg::new("spawn_failed", e.to_string()))),
        },
        Request::RenameDirectory { path, name } => {
            supervisor.rename_directory(&path, &name);
            Response::Ok
        }
        Request::SetSessionOrder { ids } => {
            supervisor.set_session_order(&ids);
            Response::Ok
        }
        Request::WriteInput { id, data } => {
            supervisor.write_input(id, Bytes::from(data));
            return None;
        }
        Request::Resize { id, cols, rows } => {
            supervisor.resize(id, cols, rows);
            return None;
        }
        Request::Favorites => Response::Favorites {
            favorites: supervisor.favorites(),
        },
        Request::AddFavorite { path } => Response::FavoriteChanged {
            changed: supervisor.add_favorite(&path),
        },
        Request::RemoveFavorite { path } => Response::FavoriteChanged {
            changed: supervisor.remove_favorite(&path),
        },
        Request::ExitHistory => Response::History {
            records: supervisor.exit_history(),
        },
        Request::LiveSessionTails => Response::Tails {
            tails: supervisor.live_session_tails(),
        },
        Request::Subscribe => Response::Subscribed,
    };
    Some(Reply::Response(response))
}

async fn recv_or_pending<T: Clone>(
    rx: &mut Option<broadcast::Receiver<T>>,
) -> Result<T, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_control<T: serde::Serialize, W: AsyncWriteExt + Unpin>(
    frame_type: FrameType,
    msg: &T,
    writer: &mut W,
) -> io::Result<()> {
    let frame = Frame::control(frame_type, msg).map_err(io::Error::other)?;
    if write_frame_with_timeout(&frame, writer).await {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "client write failed or timed out",
        ))
    }
}

/// Write a frame with a timeout. Returns false if the write failed or timed out.
async fn write_frame_with_timeout<W: AsyncWriteExt + Unpin>(
    frame: &Frame,
    writer: &mut W,
) -> bool {
    tokio::time::timeout(WRITE_TIMEOUT, frame.write_to(writer))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;
    use tokio::net::UnixStream;

    /// Start a test server on a temporary socket. The caller must keep the
    /// TempDir alive for the duration of the test.
    async fn start_test_server() -> (Supervisor, PathBuf, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config {
            shell: Some("/bin/sh".to_string()),
            data_dir: Some(dir.path().join("data")),
            persist_debounce_ms: 1,
            ..Config::default()
        };
        let supervisor = Supervisor::new(config);
        let socket_path = dir.path().join("test.sock");
        let path = socket_path.clone();

        let cancel = tokio_util::sync::CancellationToken::new();
        let server = supervisor.clone();
        tokio::spawn(async move {
            serve(server, &socket_path, cancel).await.unwrap();
        });

        // Wait for socket to appear
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        (supervisor, path, dir)
    }

    async fn round_trip(stream: &mut UnixStream, request: &Request) -> Frame {
        Frame::control(FrameType::Request, request)
            .unwrap()
            .write_to(stream)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), Frame::read_from(stream))
            .await
            .expect("response timed out")
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_sessions_empty() {
        let (_supervisor, path, _dir) = start_test_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();

        let frame = round_trip(&mut stream, &Request::ListSessions).await;
        assert_eq!(frame.frame_type, FrameType::Response);
        assert_eq!(
            frame.parse_json::<Response>().unwrap(),
            Response::Sessions { sessions: vec![] }
        );
    }

    #[tokio::test]
    async fn test_many_requests_on_one_connection() {
        let (supervisor, path, _dir) = start_test_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();

        let add = Request::AddFavorite {
            path: PathBuf::from("/srv"),
        };
        let frame = round_trip(&mut stream, &add).await;
        assert_eq!(
            frame.parse_json::<Response>().unwrap(),
            Response::FavoriteChanged { changed: true }
        );

        let rename = Request::RenameDirectory {
            path: PathBuf::from("/srv"),
            name: "Services".to_string(),
        };
        let frame = round_trip(&mut stream, &rename).await;
        assert_eq!(frame.parse_json::<Response>().unwrap(), Response::Ok);

        let frame = round_trip(&mut stream, &Request::Favorites).await;
        match frame.parse_json::<Response>().unwrap() {
            Response::Favorites { favorites } => {
                assert_eq!(favorites.len(), 1);
                assert_eq!(favorites[0].title, "Services");
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(supervisor.favorites().len(), 1);
    }

    #[tokio::test]
    async fn test_fire_and_forget_requests_get_no_response() {
        let (_supervisor, path, _dir) = start_test_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();

        for request in [
            Request::WriteInput {
                id: 42,
                data: b"ignored".to_vec(),
            },
            Request::Resize {
                id: 42,
                cols: 100,
                rows: 30,
            },
        ] {
            Frame::control(FrameType::Request, &request)
                .unwrap()
                .write_to(&mut stream)
                .await
                .unwrap();
        }

        // The next frame on the wire answers the history request.
        let frame = round_trip(&mut stream, &Request::ExitHistory).await;
        assert_eq!(
            frame.parse_json::<Response>().unwrap(),
            Response::History { records: vec![] }
        );
    }

    #[tokio::test]
    async fn test_invalid_request_returns_error_and_keeps_connection() {
        let (_supervisor, path, _dir) = start_test_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();

        Frame::new(FrameType::Request, Bytes::from_static(b"{\"op\":\"nope\"}"))
            .write_to(&mut stream)
            .await
            .unwrap();
        let frame = Frame::read_from(&mut stream).await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Error);
        let err: ErrorMsg = frame.parse_json().unwrap();
        assert_eq!(err.code, "invalid_request");

        Frame::new(FrameType::Event, Bytes::new())
            .write_to(&mut stream)
            .await
            .unwrap();
        let frame = Frame::read_from(&mut stream).await.unwrap();
        let err: ErrorMsg = frame.parse_json().unwrap();
        assert_eq!(err.code, "unexpected_frame");

        let frame = round_trip(&mut stream, &Request::RemoveGhost { index: 3 }).await;
        assert_eq!(
            frame.parse_json::<Response>().unwrap(),
            Response::GhostRemoved {
                working_directory: None
            }
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let (_supervisor, path, _dir) = start_test_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();

        let frame = round_trip(&mut stream, &Request::RespawnGhost { index: 0 }).await;
        assert_eq!(frame.frame_type, FrameType::Error);
        let err: ErrorMsg = frame.parse_json().unwrap();
        assert_eq!(err.code, "spawn_failed");
    }

    #[tokio::test]
    async fn test_subscribe_ignores_unknown_sessions() {
        let (supervisor, path, _dir) = start_test_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();

        let frame = round_trip(&mut stream, &Request::Subscribe).await;
        assert_eq!(frame.parse_json::<Response>().unwrap(), Response::Subscribed);

        supervisor.on_exit(77, Some(0));
        supervisor.on_output(77, Bytes::from_static(b"dropped"));
        // Neither call refers to a registered session, so nothing is sent.
        let quiet =
            tokio::time::timeout(Duration::from_millis(100), Frame::read_from(&mut stream)).await;
        assert!(quiet.is_err());
    }

    #[test]
    fn test_default_socket_path() {
        let path = default_socket_path();
        assert!(path.to_string_lossy().ends_with("ghostmux.sock"));
    }

    #[tokio::test]
    async fn test_refuses_to_replace_live_socket() {
        let (supervisor, path, _dir) = start_test_server().await;
        let cancel = tokio_util::sync::CancellationToken::new();
        let err = serve(supervisor, &path, cancel).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let config = Config {
            data_dir: Some(dir.path().join("data")),
            ..Config::default()
        };
        let supervisor = Supervisor::new(config);
        let cancel = tokio_util::sync::CancellationToken::new();
        let server_cancel = cancel.clone();
        let server_path = path.clone();
        let server = tokio::spawn(async move { serve(supervisor, &server_path, server_cancel).await });

        for _ in 0..50 {
            if UnixStream::connect(&path).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(UnixStream::connect(&path).await.is_ok());
        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
