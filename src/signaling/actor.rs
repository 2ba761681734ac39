use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use super::messages::{FromPlayerMessage, FromStreamerMessage, ToPlayerMessage, ToStreamerMessage};
use super::registry::PlayerRegistry;
use super::types::{OutboundMessage, PeerHandle, PlayerId, RelayError, StreamerId};
use crate::config::StreamerPolicy;

/// Commands sent to the relay actor
pub(crate) enum RelayCommand {
    StreamerConnected {
        peer: PeerHandle,
        reply: oneshot::Sender<Result<StreamerId, RelayError>>,
    },
    StreamerMessage {
        streamer_id: StreamerId,
        msg: FromStreamerMessage,
    },
    StreamerDisconnected {
        streamer_id: StreamerId,
    },
    PlayerConnected {
        peer: PeerHandle,
        reply: oneshot::Sender<Result<PlayerId, RelayError>>,
    },
    PlayerMessage {
        player_id: PlayerId,
        msg: FromPlayerMessage,
    },
    PlayerDisconnected {
        player_id: PlayerId,
    },
    Status {
        reply: oneshot::Sender<RelayStatus>,
    },
}

/// Point-in-time view of the relay state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStatus {
    pub streamer_connected: bool,
    pub players: usize,
}

#[derive(Debug)]
struct StreamerSlot {
    id: StreamerId,
    peer: PeerHandle,
}

/// Relay state: the streamer slot and the player registry, plus the routing rules
/// between them. Owned by exactly one task.
#[derive(Debug)]
pub(crate) struct Relay {
    peer_connection_options: Value,
    policy: StreamerPolicy,
    streamer: Option<StreamerSlot>,
    next_streamer_id: u64,
    players: PlayerRegistry,
}

impl Relay {
    pub fn new(peer_connection_options: Value, policy: StreamerPolicy) -> Self {
        Self {
            peer_connection_options,
            policy,
            streamer: None,
            next_streamer_id: 1,
            players: PlayerRegistry::new(),
        }
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            streamer_connected: self.streamer.is_some(),
            players: self.players.count(),
        }
    }

    pub fn connect_streamer(&mut self, peer: PeerHandle) -> Result<StreamerId, RelayError> {
        if let Some(current) = &self.streamer {
            match self.policy {
                StreamerPolicy::Reject => {
                    warn!(
                        "Rejecting streamer {}: {} ({}) still connected",
                        peer.addr(),
                        current.id,
                        current.peer.addr()
                    );
                    return Err(RelayError::StreamerAlreadyConnected);
                }
                StreamerPolicy::Replace => {
                    warn!(
                        "Streamer {} replaces {} ({})",
                        peer.addr(),
                        current.id,
                        current.peer.addr()
                    );
                    current
                        .peer
                        .close(CloseCode::Normal, "Replaced by another streamer");
                    self.streamer = None;
                    self.disconnect_all_players();
                }
            }
        }

        let id = StreamerId::new(self.next_streamer_id);
        self.next_streamer_id += 1;

        peer.send_json(&ToStreamerMessage::Config {
            peer_connection_options: self.peer_connection_options.clone(),
        });
        info!("Streamer connected: {} as {}", peer.addr(), id);
        self.streamer = Some(StreamerSlot { id, peer });
        Ok(id)
    }

    pub fn disconnect_streamer(&mut self, streamer_id: StreamerId) {
        match &self.streamer {
            Some(slot) if slot.id == streamer_id => {
                info!("Streamer {} ({}) disconnected", slot.id, slot.peer.addr());
                self.streamer = None;
                self.disconnect_all_players();
            }
            _ => debug!("Ignoring disconnect of stale {}", streamer_id),
        }
    }

    pub fn streamer_message(&mut self, streamer_id: StreamerId, msg: FromStreamerMessage) {
        let Some(slot) = self.streamer.as_ref().filter(|s| s.id == streamer_id) else {
            debug!(
                "Dropping {} from stale {}",
                msg.type_name(),
                streamer_id
            );
            return;
        };

        match msg {
            FromStreamerMessage::Ping { time } => {
                slot.peer.send_json(&ToStreamerMessage::Pong { time });
            }
            FromStreamerMessage::Offer { player_id, body } => {
                self.send_to_player(player_id, &ToPlayerMessage::Offer { body });
            }
            FromStreamerMessage::Answer { player_id, body } => {
                self.send_to_player(player_id, &ToPlayerMessage::Answer { body });
            }
            FromStreamerMessage::IceCandidate { player_id, body } => {
                self.send_to_player(
                    player_id,
                    &ToPlayerMessage::IceCandidate {
                        player_id: Some(player_id),
                        body,
                    },
                );
            }
            FromStreamerMessage::DisconnectPlayer { player_id, reason } => {
                match self.players.lookup(player_id) {
                    Some(entry) => {
                        info!("Streamer disconnects player {}: {}", player_id, reason);
                        entry.peer.close(CloseCode::Error, reason);
                    }
                    None => debug!("disconnectPlayer for unknown player {}", player_id),
                }
            }
        }
    }

    pub fn connect_player(&mut self, peer: PeerHandle) -> Result<PlayerId, RelayError> {
        if self.streamer.is_none() {
            info!("Rejecting player {}: streamer is not connected", peer.addr());
            return Err(RelayError::NoStreamer);
        }

        peer.send_json(&ToPlayerMessage::Config {
            peer_connection_options: self.peer_connection_options.clone(),
        });
        let addr = peer.addr();
        let player_id = self.players.register(peer);
        info!("Player {} ({}) connected", player_id, addr);

        self.send_to_streamer(&ToStreamerMessage::PlayerConnected {
            player_id,
            data_channel: true,
            sfu: false,
        });
        self.broadcast_player_count();
        Ok(player_id)
    }

    pub fn player_message(&mut self, player_id: PlayerId, msg: FromPlayerMessage) {
        if self.players.lookup(player_id).is_none() {
            debug!("Dropping message from unregistered player {}", player_id);
            return;
        }

        if let FromPlayerMessage::Stats { data } = &msg {
            info!("Player {} stats: {}", player_id, data);
        }
        if let Some(out) = msg.into_streamer_message(player_id) {
            self.send_to_streamer(&out);
        }
    }

    /// Idempotent: only the first call for a given id notifies anyone.
    pub fn disconnect_player(&mut self, player_id: PlayerId) {
        let Some(entry) = self.players.remove(player_id) else {
            return;
        };
        info!("Player {} ({}) disconnected", player_id, entry.peer.addr());

        self.send_to_streamer(&ToStreamerMessage::PlayerDisconnected { player_id });
        self.broadcast_player_count();
    }

    fn disconnect_all_players(&mut self) {
        if self.players.is_empty() {
            return;
        }
        info!("Disconnecting all {} players", self.players.count());
        for entry in self.players.snapshot() {
            entry.peer.close(CloseCode::Normal, "Streamer disconnected");
            self.players.remove(entry.id);
        }
    }

    fn send_to_player(&self, player_id: PlayerId, msg: &ToPlayerMessage) {
        match self.players.lookup(player_id) {
            Some(entry) => {
                entry.peer.send_json(msg);
            }
            None => debug!("Player {} not found, dropping message", player_id),
        }
    }

    fn send_to_streamer(&self, msg: &ToStreamerMessage) {
        match &self.streamer {
            Some(slot) => {
                slot.peer.send_json(msg);
            }
            None => warn!("No streamer connected, dropping {}", msg.type_name()),
        }
    }

    fn broadcast_player_count(&self) {
        let msg = ToPlayerMessage::PlayerCount {
            count: self.players.count(),
        };
        let out = match OutboundMessage::json(&msg) {
            Ok(out) => out,
            Err(e) => {
                warn!("Failed to serialize player count: {}", e);
                return;
            }
        };
        for entry in self.players.iter() {
            entry.peer.send(out.clone());
        }
    }
}

pub(crate) async fn relay_actor(mut rx: mpsc::Receiver<RelayCommand>, mut relay: Relay) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RelayCommand::StreamerConnected { peer, reply } => {
                let _ = reply.send(relay.connect_streamer(peer));
            }
            RelayCommand::StreamerMessage { streamer_id, msg } => {
                relay.streamer_message(streamer_id, msg);
            }
            RelayCommand::StreamerDisconnected { streamer_id } => {
                relay.disconnect_streamer(streamer_id);
            }
            RelayCommand::PlayerConnected { peer, reply } => {
                let _ = reply.send(relay.connect_player(peer));
            }
            RelayCommand::PlayerMessage { player_id, msg } => {
                relay.player_message(player_id, msg);
            }
            RelayCommand::PlayerDisconnected { player_id } => {
                relay.disconnect_player(player_id);
            }
            RelayCommand::Status { reply } => {
                let _ = reply.send(relay.status());
            }
        }
    }
    debug!("Relay actor stopped");
}

/// Handle to communicate with the relay actor
#[derive(Clone)]
pub struct RelayHandle {
    pub(crate) tx: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    /// Spawn a relay actor on the current runtime.
    pub fn spawn(peer_connection_options: Value, policy: StreamerPolicy) -> Self {
        let (tx, rx) = mpsc::channel::<RelayCommand>(1024);
        tokio::spawn(relay_actor(rx, Relay::new(peer_connection_options, policy)));
        Self { tx }
    }

    /// Occupy the streamer slot
    pub async fn connect_streamer(&self, peer: PeerHandle) -> Result<StreamerId, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RelayCommand::StreamerConnected {
            peer,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| actor_gone())?
    }

    pub async fn streamer_message(&self, streamer_id: StreamerId, msg: FromStreamerMessage) {
        let _ = self
            .send(RelayCommand::StreamerMessage { streamer_id, msg })
            .await;
    }

    pub async fn disconnect_streamer(&self, streamer_id: StreamerId) {
        let _ = self
            .send(RelayCommand::StreamerDisconnected { streamer_id })
            .await;
    }

    /// Register a player; fails if no streamer is connected
    pub async fn connect_player(&self, peer: PeerHandle) -> Result<PlayerId, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RelayCommand::PlayerConnected {
            peer,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| actor_gone())?
    }

    pub async fn player_message(&self, player_id: PlayerId, msg: FromPlayerMessage) {
        let _ = self
            .send(RelayCommand::PlayerMessage { player_id, msg })
            .await;
    }

    pub async fn disconnect_player(&self, player_id: PlayerId) {
        let _ = self
            .send(RelayCommand::PlayerDisconnected { player_id })
            .await;
    }

    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RelayCommand::Status { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| actor_gone())
    }

    async fn send(&self, cmd: RelayCommand) -> Result<(), RelayError> {
        self.tx.send(cmd).await.map_err(|_| actor_gone())
    }
}

fn actor_gone() -> RelayError {
    RelayError::Internal("actor channel closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::signaling::messages::Body;

    struct TestPeer {
        handle: PeerHandle,
        rx: UnboundedReceiver<OutboundMessage>,
    }

    impl TestPeer {
        fn new(port: u16) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                handle: PeerHandle::new(format!("127.0.0.1:{}", port).parse().unwrap(), tx),
                rx,
            }
        }

        fn drain(&mut self) -> Vec<OutboundMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }

        fn drain_json(&mut self) -> Vec<Value> {
            self.drain()
                .into_iter()
                .map(|msg| match msg {
                    OutboundMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                    other => panic!("expected text frame, got {:?}", other),
                })
                .collect()
        }

        fn expect_close(&mut self) -> (u16, String) {
            let frames = self.drain();
            match frames.last() {
                Some(OutboundMessage::Close { code, reason }) => (u16::from(*code), reason.clone()),
                other => panic!("expected close, got {:?}", other),
            }
        }
    }

    fn relay() -> Relay {
        Relay::new(json!({}), StreamerPolicy::Replace)
    }

    fn body(pairs: Value) -> Body {
        serde_json::from_str(&pairs.to_string()).unwrap()
    }

    #[test]
    fn players_rejected_without_streamer() {
        let mut relay = relay();
        for port in 0..3 {
            let mut player = TestPeer::new(5000 + port);
            let result = relay.connect_player(player.handle.clone());
            assert!(matches!(result, Err(RelayError::NoStreamer)));
            assert!(player.drain().is_empty());
        }
        assert_eq!(relay.status().players, 0);
    }

    #[test]
    fn streamer_gets_config_first() {
        let mut relay = relay();
        let mut streamer = TestPeer::new(1);
        relay.connect_streamer(streamer.handle.clone()).unwrap();
        assert_eq!(
            streamer.drain_json(),
            vec![json!({"type": "config", "peerConnectionOptions": {}})]
        );
    }

    #[test]
    fn players_join_and_leave_with_notifications() {
        let mut relay = relay();
        let mut streamer = TestPeer::new(1);
        relay.connect_streamer(streamer.handle.clone()).unwrap();
        streamer.drain();

        let mut players: Vec<TestPeer> = (0..3).map(|i| TestPeer::new(100 + i)).collect();
        let mut ids = Vec::new();
        for player in &players {
            ids.push(relay.connect_player(player.handle.clone()).unwrap());
        }
        assert_eq!(relay.status().players, 3);
        let distinct: HashSet<PlayerId> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), 3);

        let notices = streamer.drain_json();
        assert_eq!(notices.len(), 3);
        for (notice, id) in notices.iter().zip(&ids) {
            assert_eq!(
                notice,
                &json!({"type": "playerConnected", "playerId": id.get(), "dataChannel": true, "sfu": false})
            );
        }

        // First player saw config then counts 1, 2, 3
        let first = players[0].drain_json();
        assert_eq!(first[0]["type"], "config");
        let counts: Vec<_> = first[1..].iter().map(|m| m["count"].as_u64().unwrap()).collect();
        assert_eq!(counts, vec![1, 2, 3]);

        relay.disconnect_player(ids[1]);
        assert_eq!(
            streamer.drain_json(),
            vec![json!({"type": "playerDisconnected", "playerId": ids[1].get()})]
        );
        assert_eq!(
            players[2].drain_json().last().unwrap(),
            &json!({"type": "playerCount", "count": 2})
        );
    }

    #[test]
    fn disconnect_player_is_idempotent() {
        let mut relay = relay();
        let mut streamer = TestPeer::new(1);
        relay.connect_streamer(streamer.handle.clone()).unwrap();
        let player = TestPeer::new(2);
        let id = relay.connect_player(player.handle.clone()).unwrap();
        streamer.drain();

        relay.disconnect_player(id);
        relay.disconnect_player(id);
        relay.disconnect_player(PlayerId::new(999));

        assert_eq!(streamer.drain_json().len(), 1);
    }

    #[test]
    fn offer_is_routed_without_player_id() {
        let mut relay = relay();
        let streamer = TestPeer::new(1);
        let sid = relay.connect_streamer(streamer.handle.clone()).unwrap();
        let mut player = TestPeer::new(2);
        let id = relay.connect_player(player.handle.clone()).unwrap();
        player.drain();

        relay.streamer_message(
            sid,
            FromStreamerMessage::Offer {
                player_id: id,
                body: body(json!({"sdp": "v=0", "extra": [1, 2]})),
            },
        );
        assert_eq!(
            player.drain_json(),
            vec![json!({"type": "offer", "sdp": "v=0", "extra": [1, 2]})]
        );
    }

    #[test]
    fn ice_candidate_to_player_keeps_player_id() {
        let mut relay = relay();
        let streamer = TestPeer::new(1);
        let sid = relay.connect_streamer(streamer.handle.clone()).unwrap();
        let mut player = TestPeer::new(2);
        let id = relay.connect_player(player.handle.clone()).unwrap();
        player.drain();

        relay.streamer_message(
            sid,
            FromStreamerMessage::IceCandidate {
                player_id: id,
                body: body(json!({"candidate": {"candidate": "c"}})),
            },
        );
        assert_eq!(
            player.drain_json(),
            vec![json!({"type": "iceCandidate", "playerId": id.get(), "candidate": {"candidate": "c"}})]
        );
    }

    #[test]
    fn message_to_unknown_player_is_dropped() {
        let mut relay = relay();
        let mut streamer = TestPeer::new(1);
        let sid = relay.connect_streamer(streamer.handle.clone()).unwrap();
        streamer.drain();

        relay.streamer_message(
            sid,
            FromStreamerMessage::Answer {
                player_id: PlayerId::new(77),
                body: Body::new(),
            },
        );
        assert!(streamer.drain().is_empty());
    }

    #[test]
    fn player_answer_reaches_streamer_with_id() {
        let mut relay = relay();
        let mut streamer = TestPeer::new(1);
        relay.connect_streamer(streamer.handle.clone()).unwrap();
        let player = TestPeer::new(2);
        let id = relay.connect_player(player.handle.clone()).unwrap();
        streamer.drain();

        relay.player_message(
            id,
            FromPlayerMessage::Answer {
                body: body(json!({"sdp": "answer-sdp"})),
            },
        );
        assert_eq!(
            streamer.drain_json(),
            vec![json!({"type": "answer", "playerId": id.get(), "sdp": "answer-sdp"})]
        );
    }

    #[test]
    fn stats_are_logged_only() {
        let mut relay = relay();
        let mut streamer = TestPeer::new(1);
        relay.connect_streamer(streamer.handle.clone()).unwrap();
        let mut player = TestPeer::new(2);
        let id = relay.connect_player(player.handle.clone()).unwrap();
        streamer.drain();
        player.drain();

        relay.player_message(id, FromPlayerMessage::Stats { data: json!({"fps": 60}) });
        assert!(streamer.drain().is_empty());
        assert!(player.drain().is_empty());
    }

    #[test]
    fn ping_gets_pong_only() {
        let mut relay = relay();
        let mut streamer = TestPeer::new(1);
        let sid = relay.connect_streamer(streamer.handle.clone()).unwrap();
        let mut player = TestPeer::new(2);
        relay.connect_player(player.handle.clone()).unwrap();
        streamer.drain();
        player.drain();

        relay.streamer_message(sid, FromStreamerMessage::Ping { time: Some(json!("T")) });
        assert_eq!(streamer.drain_json(), vec![json!({"type": "pong", "time": "T"})]);
        assert!(player.drain().is_empty());
        assert_eq!(relay.status().players, 1);
    }

    #[test]
    fn disconnect_player_request_closes_with_internal_error() {
        let mut relay = relay();
        let streamer = TestPeer::new(1);
        let sid = relay.connect_streamer(streamer.handle.clone()).unwrap();
        let mut player = TestPeer::new(2);
        let id = relay.connect_player(player.handle.clone()).unwrap();

        relay.streamer_message(
            sid,
            FromStreamerMessage::DisconnectPlayer {
                player_id: id,
                reason: "kicked".to_string(),
            },
        );
        assert_eq!(player.expect_close(), (1011, "kicked".to_string()));
        // Removal happens when the player's connection reports back
        assert_eq!(relay.status().players, 1);
    }

    #[test]
    fn streamer_loss_cascades_to_all_players() {
        let mut relay = relay();
        let streamer = TestPeer::new(1);
        let sid = relay.connect_streamer(streamer.handle.clone()).unwrap();
        let mut players: Vec<TestPeer> = (0..3).map(|i| TestPeer::new(10 + i)).collect();
        let ids: Vec<_> = players
            .iter()
            .map(|p| relay.connect_player(p.handle.clone()).unwrap())
            .collect();

        relay.disconnect_streamer(sid);

        for player in &mut players {
            assert_eq!(player.expect_close().0, 1000);
        }
        assert_eq!(
            relay.status(),
            RelayStatus {
                streamer_connected: false,
                players: 0
            }
        );

        // Late reports from the closed players change nothing
        for id in ids {
            relay.disconnect_player(id);
        }
        assert_eq!(relay.status().players, 0);
    }

    #[test]
    fn replacing_streamer_cascades_and_ignores_stale_session() {
        let mut relay = relay();
        let mut old = TestPeer::new(1);
        let old_id = relay.connect_streamer(old.handle.clone()).unwrap();
        let mut player = TestPeer::new(2);
        relay.connect_player(player.handle.clone()).unwrap();
        old.drain();

        let mut new = TestPeer::new(3);
        let new_id = relay.connect_streamer(new.handle.clone()).unwrap();
        assert_ne!(old_id, new_id);
        assert_eq!(old.expect_close().0, 1000);
        assert_eq!(player.expect_close().0, 1000);
        assert_eq!(new.drain_json()[0]["type"], "config");

        relay.streamer_message(old_id, FromStreamerMessage::Ping { time: None });
        relay.disconnect_streamer(old_id);
        assert!(old.drain().is_empty());
        assert!(relay.status().streamer_connected);
    }

    #[test]
    fn reject_policy_keeps_first_streamer() {
        let mut relay = Relay::new(json!({}), StreamerPolicy::Reject);
        let mut first = TestPeer::new(1);
        relay.connect_streamer(first.handle.clone()).unwrap();
        first.drain();

        let second = TestPeer::new(2);
        let result = relay.connect_streamer(second.handle.clone());
        assert!(matches!(result, Err(RelayError::StreamerAlreadyConnected)));
        assert!(first.drain().is_empty());
    }

    #[test]
    fn message_from_removed_player_is_dropped() {
        let mut relay = relay();
        let streamer = TestPeer::new(1);
        let sid = relay.connect_streamer(streamer.handle.clone()).unwrap();
        let mut player = TestPeer::new(2);
        let id = relay.connect_player(player.handle.clone()).unwrap();
        // Streamer slot cleared, player already closed and removed
        relay.disconnect_streamer(sid);
        player.drain();

        relay.player_message(id, FromPlayerMessage::IceCandidate { body: Body::new() });
        assert!(player.drain().is_empty());
    }

    #[tokio::test]
    async fn handle_round_trips_through_actor() {
        let handle = RelayHandle::spawn(json!({"iceServers": []}), StreamerPolicy::Replace);
        let mut streamer = TestPeer::new(1);
        handle.connect_streamer(streamer.handle.clone()).await.unwrap();

        let mut player = TestPeer::new(2);
        let id = handle.connect_player(player.handle.clone()).await.unwrap();
        assert_eq!(
            handle.status().await.unwrap(),
            RelayStatus {
                streamer_connected: true,
                players: 1
            }
        );

        handle.disconnect_player(id).await;
        assert_eq!(handle.status().await.unwrap().players, 0);

        let config = &streamer.drain_json()[0];
        assert_eq!(config["peerConnectionOptions"], json!({"iceServers": []}));
        assert_eq!(player.drain_json()[0]["type"], "config");
    }
}
