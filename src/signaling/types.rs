use std::fmt;
use std::net::SocketAddr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Bytes, Message, Utf8Bytes};
use tracing::{debug, error};

/// Relay errors surfaced to connection handlers
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("streamer is not connected")]
    NoStreamer,

    #[error("streamer already connected")]
    StreamerAlreadyConnected,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Maximum close reason length: a close frame payload is capped at 125 bytes,
/// two of which hold the code.
const MAX_CLOSE_REASON_LEN: usize = 123;

/// Player identifier, allocated from a per-process counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlayerId(u64);

impl PlayerId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for PlayerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

/// Streamers may address players either as a number or as a decimal string.
impl<'de> Deserialize<'de> for PlayerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PlayerIdVisitor;

        impl Visitor<'_> for PlayerIdVisitor {
            type Value = PlayerId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or a decimal string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PlayerId, E> {
                Ok(PlayerId(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PlayerId, E> {
                u64::try_from(v)
                    .map(PlayerId)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PlayerId, E> {
                v.trim()
                    .parse::<u64>()
                    .map(PlayerId)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(PlayerIdVisitor)
    }
}

/// Identifies one streamer session; a replaced streamer keeps its stale id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamerId(u64);

impl StreamerId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for StreamerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "streamer#{}", self.0)
    }
}

/// Frames queued for a connection's single writer task.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Text(Utf8Bytes),
    Ping,
    Close { code: CloseCode, reason: String },
}

impl OutboundMessage {
    /// Serialize a message into a text frame.
    pub fn json<T: Serialize>(msg: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::Text(Utf8Bytes::from(serde_json::to_string(msg)?)))
    }

    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON_LEN {
            let mut end = MAX_CLOSE_REASON_LEN;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self::Close { code, reason }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close { .. })
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Ping => Message::Ping(Bytes::new()),
            Self::Close { code, reason } => Message::Close(Some(CloseFrame {
                code,
                reason: Utf8Bytes::from(reason),
            })),
        }
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self::Text(Utf8Bytes::from(s))
    }
}

/// Send side of a connection. Cheap to clone; all writes funnel through the
/// connection's writer task, so sends from different tasks never interleave
/// inside a frame.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl PeerHandle {
    pub fn new(addr: SocketAddr, tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { addr, tx }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a frame. Returns false if the writer is already gone.
    pub fn send(&self, msg: OutboundMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub fn send_json<T: Serialize>(&self, msg: &T) -> bool {
        match serde_json::to_string(msg) {
            Ok(text) => {
                debug!("<- {}: {}", self.addr, text);
                self.send(OutboundMessage::from(text))
            }
            Err(e) => {
                error!("Failed to serialize message for {}: {}", self.addr, e);
                false
            }
        }
    }

    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> bool {
        self.send(OutboundMessage::close(code, reason))
    }
}
