//! WebSocket signalling relay: one streamer, many players

mod actor;
mod messages;
mod registry;
mod server;
mod types;

pub use actor::{RelayHandle, RelayStatus};
pub use messages::{
    Body, FromPlayerMessage, FromStreamerMessage, ParseError, ToPlayerMessage, ToStreamerMessage,
    parse_player_message, parse_streamer_message,
};
pub use registry::{PlayerEntry, PlayerRegistry};
pub use server::{DEFAULT_PLAYER_PORT, DEFAULT_STREAMER_PORT, SignalingServer};
pub use types::{OutboundMessage, PeerHandle, PlayerId, RelayError, StreamerId};
