use std::fmt;

use serde::de::{DeserializeOwned, IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use serde_json::value::RawValue;
use thiserror::Error;

use super::types::PlayerId;

/// Envelope keys the relay owns; they never travel inside a body.
const ENVELOPE_FIELDS: [&str; 2] = ["type", "playerId"];

/// Opaque message body: every field except `type` and the routing id, each
/// kept as the exact JSON text the sender wrote and in the sender's order.
#[derive(Debug, Clone, Default)]
pub struct Body {
    fields: Vec<(String, Box<RawValue>)>,
}

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field. A repeated key keeps its first position and takes the new value.
    pub fn insert(&mut self, key: impl Into<String>, value: Box<RawValue>) {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Raw JSON text of a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.get())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl PartialEq for Body {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|((ka, va), (kb, vb))| ka == kb && va.get() == vb.get())
    }
}

impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Only readable straight from JSON text: raw values do not survive buffering
/// through an intermediate `Value`.
impl<'de> Deserialize<'de> for Body {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BodyVisitor;

        impl<'de> Visitor<'de> for BodyVisitor {
            type Value = Body;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Body, A::Error> {
                let mut body = Body::new();
                while let Some(key) = map.next_key::<String>()? {
                    if ENVELOPE_FIELDS.contains(&key.as_str()) {
                        map.next_value::<IgnoredAny>()?;
                    } else {
                        body.insert(key, map.next_value::<Box<RawValue>>()?);
                    }
                }
                Ok(body)
            }
        }

        deserializer.deserialize_map(BodyVisitor)
    }
}

/// `"time": null` is echoed back, a missing `time` is not.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Messages sent from a player to the relay
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum FromPlayerMessage {
    /// SDP answer to the streamer's offer
    #[serde(rename = "answer")]
    Answer {
        #[serde(skip)]
        body: Body,
    },

    #[serde(rename = "iceCandidate")]
    IceCandidate {
        #[serde(skip)]
        body: Body,
    },

    /// Client telemetry; logged, never forwarded
    #[serde(rename = "stats")]
    Stats {
        #[serde(default)]
        data: Value,
    },
}

impl FromPlayerMessage {
    /// Re-envelope a player message for the streamer, tagged with the sender's id.
    /// Any `playerId` the player supplied itself never made it into the body.
    pub fn into_streamer_message(self, player_id: PlayerId) -> Option<ToStreamerMessage> {
        match self {
            Self::Answer { body } => Some(ToStreamerMessage::Answer { player_id, body }),
            Self::IceCandidate { body } => {
                Some(ToStreamerMessage::IceCandidate { player_id, body })
            }
            Self::Stats { .. } => None,
        }
    }
}

/// Messages sent from the relay to a player
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ToPlayerMessage {
    /// Sent once, right after the player is accepted
    #[serde(rename = "config")]
    Config {
        #[serde(rename = "peerConnectionOptions")]
        peer_connection_options: Value,
    },

    #[serde(rename = "offer")]
    Offer {
        #[serde(flatten)]
        body: Body,
    },

    #[serde(rename = "answer")]
    Answer {
        #[serde(flatten)]
        body: Body,
    },

    #[serde(rename = "iceCandidate")]
    IceCandidate {
        #[serde(rename = "playerId", skip_serializing_if = "Option::is_none")]
        player_id: Option<PlayerId>,
        #[serde(flatten)]
        body: Body,
    },

    /// Number of players currently connected, broadcast on every join/leave
    #[serde(rename = "playerCount")]
    PlayerCount { count: usize },
}

/// Messages sent from the streamer to the relay
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum FromStreamerMessage {
    /// Application-level ping, answered immediately with `pong`
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, deserialize_with = "present")]
        time: Option<Value>,
    },

    #[serde(rename = "offer")]
    Offer {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        #[serde(skip)]
        body: Body,
    },

    #[serde(rename = "answer")]
    Answer {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        #[serde(skip)]
        body: Body,
    },

    #[serde(rename = "iceCandidate")]
    IceCandidate {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        #[serde(skip)]
        body: Body,
    },

    /// Ask the relay to drop a player
    #[serde(rename = "disconnectPlayer")]
    DisconnectPlayer {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        #[serde(default)]
        reason: String,
    },
}

impl FromStreamerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "iceCandidate",
            Self::DisconnectPlayer { .. } => "disconnectPlayer",
        }
    }
}

/// Messages sent from the relay to the streamer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ToStreamerMessage {
    /// Sent once, right after the streamer is accepted
    #[serde(rename = "config")]
    Config {
        #[serde(rename = "peerConnectionOptions")]
        peer_connection_options: Value,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        time: Option<Value>,
    },

    #[serde(rename = "playerConnected")]
    PlayerConnected {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        #[serde(rename = "dataChannel")]
        data_channel: bool,
        sfu: bool,
    },

    #[serde(rename = "playerDisconnected")]
    PlayerDisconnected {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },

    #[serde(rename = "answer")]
    Answer {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        #[serde(flatten)]
        body: Body,
    },

    #[serde(rename = "iceCandidate")]
    IceCandidate {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        #[serde(flatten)]
        body: Body,
    },
}

impl ToStreamerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Pong { .. } => "pong",
            Self::PlayerConnected { .. } => "playerConnected",
            Self::PlayerDisconnected { .. } => "playerDisconnected",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "iceCandidate",
        }
    }
}

/// Why an inbound frame was refused. Every variant closes the sender with 1008.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot parse message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("message is not valid UTF-8")]
    NotUtf8,

    #[error("unsupported message type {tag:?}: {source}")]
    Unsupported {
        tag: Option<String>,
        #[source]
        source: serde_json::Error,
    },
}

impl ParseError {
    /// Close reason sent back to the offending peer.
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::NotUtf8 => "Cannot parse",
            Self::Unsupported { .. } => "Unsupported message type",
        }
    }
}

pub fn parse_player_message(text: &str) -> Result<FromPlayerMessage, ParseError> {
    parse(text)
}

pub fn parse_streamer_message(text: &str) -> Result<FromStreamerMessage, ParseError> {
    parse(text)
}

/// Inbound messages whose body is forwarded verbatim.
trait Inbound: DeserializeOwned {
    fn body_mut(&mut self) -> Option<&mut Body>;
}

impl Inbound for FromPlayerMessage {
    fn body_mut(&mut self) -> Option<&mut Body> {
        match self {
            Self::Answer { body } | Self::IceCandidate { body } => Some(body),
            Self::Stats { .. } => None,
        }
    }
}

impl Inbound for FromStreamerMessage {
    fn body_mut(&mut self) -> Option<&mut Body> {
        match self {
            Self::Offer { body, .. } | Self::Answer { body, .. } | Self::IceCandidate { body, .. } => {
                Some(body)
            }
            Self::Ping { .. } | Self::DisconnectPlayer { .. } => None,
        }
    }
}

/// Decode the JSON envelope first, then match it against the role's closed set.
/// Forwarded bodies are read a second time from the original text so their
/// values go out exactly as they came in.
fn parse<T: Inbound>(text: &str) -> Result<T, ParseError> {
    let value: Value = serde_json::from_str(text).map_err(ParseError::Malformed)?;
    let tag = value.get("type").and_then(Value::as_str).map(str::to_owned);
    let mut msg: T =
        serde_json::from_value(value).map_err(|source| ParseError::Unsupported { tag, source })?;
    if let Some(body) = msg.body_mut() {
        *body = serde_json::from_str(text).map_err(ParseError::Malformed)?;
    }
    Ok(msg)
}
