//! Unix socket client for the ghostmux daemon.
//!
//! A thin request/response wrapper around one connection: send a
//! [`Request`] frame, read back the matching [`Response`] (or [`ErrorMsg`]),
//! and after [`Client::subscribe`] read the event stream.

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::UnixStream;

use crate::protocol::*;
use crate::session::{SessionId, SessionListing};
use crate::supervisor::SessionDescriptor;

/// A client connection to the ghostmux daemon over a Unix socket.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Connect to the server's Unix domain socket.
    pub async fn connect(socket_path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
            ) {
                io::Error::new(
                    e.kind(),
                    format!(
                        "could not connect to ghostmux server at {}, is the server running?",
                        socket_path.display()
                    ),
                )
            } else {
                e
            }
        })?;
        Ok(Self { stream })
    }

    /// Send a request without waiting for anything back.
    pub async fn send(&mut self, request: &Request) -> io::Result<()> {
        let frame = Frame::control(FrameType::Request, request)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        frame.write_to(&mut self.stream).await
    }

    /// Send a request and read its response.
    ///
    /// Event frames that arrive first (on a subscribed connection) are
    /// skipped. For requests that get no response this returns
    /// [`Response::Ok`] right after sending.
    pub async fn request(&mut self, request: &Request) -> io::Result<Response> {
        self.send(request).await?;
        if !request.expects_response() {
            return Ok(Response::Ok);
        }
        loop {
            let frame = Frame::read_from(&mut self.stream).await?;
            match frame.frame_type {
                FrameType::Response => {
                    return frame
                        .parse_json()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
                }
                FrameType::Error => return Err(server_error(&frame)),
                FrameType::Event => continue,
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected response frame type: {:?}", other),
                    ))
                }
            }
        }
    }

    pub async fn create_session(
        &mut self,
        working_directory: Option<PathBuf>,
    ) -> io::Result<SessionDescriptor> {
        match self
            .request(&Request::CreateSession { working_directory })
            .await?
        {
            Response::Created { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_sessions(&mut self) -> io::Result<Vec<SessionListing>> {
        match self.request(&Request::ListSessions).await? {
            Response::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write_input(&mut self, id: SessionId, data: &[u8]) -> io::Result<()> {
        self.send(&Request::WriteInput {
            id,
            data: data.to_vec(),
        })
        .await
    }

    /// Start the event stream on this connection.
    pub async fn subscribe(&mut self) -> io::Result<()> {
        match self.request(&Request::Subscribe).await? {
            Response::Subscribed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Wait for the next event. Responses to earlier requests are skipped.
    pub async fn next_event(&mut self) -> io::Result<Event> {
        loop {
            let frame = Frame::read_from(&mut self.stream).await?;
            match frame.frame_type {
                FrameType::Event => {
                    return frame
                        .parse_json()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
                }
                FrameType::Error => return Err(server_error(&frame)),
                _ => continue,
            }
        }
    }
}

fn server_error(frame: &Frame) -> io::Error {
    match frame.parse_json::<ErrorMsg>() {
        Ok(err) => io::Error::other(format!("{}: {}", err.code, err.message)),
        Err(e) => io::Error::new(io::ErrorKind::InvalidData, e),
    }
}

fn unexpected(response: Response) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected response: {:?}", response),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Serve canned frames to the first client that connects, after reading
    /// one request frame.
    async fn fake_server(frames: Vec<Frame>) -> (PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = Frame::read_from(&mut stream).await.unwrap();
            for frame in frames {
                frame.write_to(&mut stream).await.unwrap();
            }
            // Hold the connection open until the client hangs up.
            let _ = Frame::read_from(&mut stream).await;
        });
        (path, dir)
    }

    #[tokio::test]
    async fn connect_to_missing_socket_mentions_server() {
        let dir = tempfile::tempdir().unwrap();
        let err = Client::connect(&dir.path().join("absent.sock"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("is the server running"));
    }

    #[tokio::test]
    async fn request_skips_events_before_response() {
        let frames = vec![
            Frame::control(FrameType::Event, &Event::Exited { id: 1 }).unwrap(),
            Frame::control(FrameType::Response, &Response::Sessions { sessions: vec![] }).unwrap(),
        ];
        let (path, _dir) = fake_server(frames).await;
        let mut client = Client::connect(&path).await.unwrap();
        assert!(client.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_frame_becomes_io_error() {
        let frames =
            vec![Frame::control(FrameType::Error, &ErrorMsg::new("spawn_failed", "no shell")).unwrap()];
        let (path, _dir) = fake_server(frames).await;
        let mut client = Client::connect(&path).await.unwrap();
        let err = client.create_session(None).await.unwrap_err();
        assert_eq!(err.to_string(), "spawn_failed: no shell");
    }

    #[tokio::test]
    async fn wrong_response_kind_is_invalid_data() {
        let frames = vec![Frame::control(FrameType::Response, &Response::Ok).unwrap()];
        let (path, _dir) = fake_server(frames).await;
        let mut client = Client::connect(&path).await.unwrap();
        let err = client.list_sessions().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
