//! WebRTC signalling relay between a single streamer and any number of players

pub mod config;
pub mod signaling;
