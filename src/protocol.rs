//! Unix socket protocol for ghostmux client/server communication.
//!
//! Wire format: `[type: u8][length: u32 big-endian][payload: bytes]`
//!
//! Every payload is JSON. Requests are tagged by `op`, responses by `kind`
//! and events by `event`. Raw terminal bytes travel base64-encoded.

use std::io;
use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::broker::{OutputEvent, SessionEvent};
use crate::history::ExitRecord;
use crate::session::{SessionId, SessionListing};
use crate::supervisor::{FavoriteEntry, SessionDescriptor, SessionTail};

/// Frame type byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Client → Server: a [`Request`].
    Request = 0x01,
    /// Server → Client: a [`Response`].
    Response = 0x02,
    /// Server → Client: an [`Event`], only after `subscribe`.
    Event = 0x03,
    /// Server → Client: an [`ErrorMsg`] in place of a response.
    Error = 0x04,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Response),
            0x03 => Some(Self::Event),
            0x04 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Maximum frame payload size (16 MiB). Prevents OOM on malformed data.
const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// A protocol frame with a type tag and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Create a frame from a serializable message.
    pub fn control<T: Serialize>(frame_type: FrameType, msg: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(msg)?;
        Ok(Self::new(frame_type, Bytes::from(payload)))
    }

    /// Encode this frame into bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.as_ref());
        buf.freeze()
    }

    /// Write this frame to an async writer.
    pub async fn write_to<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let encoded = self.encode();
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    /// Read a frame from an async reader.
    pub async fn read_from<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Self> {
        let type_byte = reader.read_u8().await?;
        let frame_type = FrameType::from_u8(type_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame type: 0x{:02x}", type_byte),
            )
        })?;

        let length = reader.read_u32().await?;
        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes", length),
            ));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            frame_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decode a frame from a byte buffer (synchronous, for testing).
    pub fn decode(mut data: &[u8]) -> io::Result<Self> {
        if data.len() < 5 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "frame too short",
            ));
        }

        let type_byte = data.get_u8();
        let frame_type = FrameType::from_u8(type_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame type: 0x{:02x}", type_byte),
            )
        })?;

        let length = data.get_u32();
        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes", length),
            ));
        }

        if data.remaining() < length as usize {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            ));
        }

        let payload = Bytes::copy_from_slice(&data[..length as usize]);

        Ok(Self {
            frame_type,
            payload,
        })
    }

    /// Parse the payload as a JSON message.
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

// ── Message types ──────────────────────────────────────────────────

/// Client → Server.
///
/// `write_input` and `resize` are fire-and-forget: the server sends nothing
/// back, not even on a stale id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SelectWorkingDirectory,
    CreateSession {
        #[serde(default)]
        working_directory: Option<PathBuf>,
    },
    KillSession {
        id: SessionId,
    },
    ListSessions,
    RemoveGhost {
        index: usize,
    },
    RespawnGhost {
        index: usize,
    },
    RenameDirectory {
        path: PathBuf,
        name: String,
    },
    SetSessionOrder {
        ids: Vec<SessionId>,
    },
    WriteInput {
        id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Resize {
        id: SessionId,
        cols: u16,
        rows: u16,
    },
    Favorites,
    AddFavorite {
        path: PathBuf,
    },
    RemoveFavorite {
        path: PathBuf,
    },
    ExitHistory,
    LiveSessionTails,
    /// Start receiving [`Event`] frames on this connection.
    Subscribe,
}

impl Request {
    /// Whether the server answers this request.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Request::WriteInput { .. } | Request::Resize { .. })
    }
}

/// Server → Client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// Generic acknowledgement.
    Ok,
    Directory {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Created {
        session: SessionDescriptor,
    },
    Sessions {
        sessions: Vec<SessionListing>,
    },
    GhostRemoved {
        #[serde(default)]
        working_directory: Option<PathBuf>,
    },
    Favorites {
        favorites: Vec<FavoriteEntry>,
    },
    /// Result of add/remove favorite: `false` if nothing changed.
    FavoriteChanged {
        changed: bool,
    },
    History {
        records: Vec<ExitRecord>,
    },
    Tails {
        tails: Vec<SessionTail>,
    },
    Subscribed,
}

/// Server → Client, streamed after `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Output {
        id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Created {
        id: SessionId,
    },
    Exited {
        id: SessionId,
    },
}

impl From<OutputEvent> for Event {
    fn from(ev: OutputEvent) -> Self {
        Event::Output {
            id: ev.id,
            data: ev.data.to_vec(),
        }
    }
}

impl From<SessionEvent> for Event {
    fn from(ev: SessionEvent) -> Self {
        match ev {
            SessionEvent::Created { id } => Event::Created { id },
            SessionEvent::Exited { id } => Event::Exited { id },
        }
    }
}

/// Server → Client: error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub code: String,
    pub message: String,
}

impl ErrorMsg {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Serde helper for base64-encoded byte vectors in JSON.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}
