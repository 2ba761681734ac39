use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use super::actor::RelayHandle;
use super::messages::{ParseError, parse_player_message, parse_streamer_message};
use super::types::{OutboundMessage, PeerHandle, RelayError};
use crate::config::Config;

pub const DEFAULT_PLAYER_PORT: u16 = 8000;
pub const DEFAULT_STREAMER_PORT: u16 = 8888;
const STREAMER_BACKLOG: u32 = 1;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Streamer,
    Player,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Streamer => f.write_str("streamer"),
            Role::Player => f.write_str("player"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    ping_interval: Duration,
    pong_timeout: Duration,
}

pub struct SignalingServer {
    handle: RelayHandle,
    streamer_listener: TcpListener,
    player_listener: TcpListener,
    keepalive: Keepalive,
}

impl SignalingServer {
    /// Bind both listeners and start the relay actor.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let streamer_listener = bind_with_backlog(config.streamer_addr(), STREAMER_BACKLOG)?;
        let player_listener = TcpListener::bind(config.player_addr()).await?;

        info!(
            "Listening for streamer connections on {}",
            streamer_listener.local_addr()?
        );
        info!(
            "Listening for player connections on {}",
            player_listener.local_addr()?
        );

        let handle = RelayHandle::spawn(
            config.peer_connection_options.clone(),
            config.streamer_policy,
        );

        Ok(Self {
            handle,
            streamer_listener,
            player_listener,
            keepalive: Keepalive {
                ping_interval: config.ping_interval,
                pong_timeout: config.pong_timeout,
            },
        })
    }

    pub fn streamer_addr(&self) -> io::Result<SocketAddr> {
        self.streamer_listener.local_addr()
    }

    pub fn player_addr(&self) -> io::Result<SocketAddr> {
        self.player_listener.local_addr()
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Run both accept loops. Never returns on its own.
    pub async fn run(self) {
        let streamers = accept_loop(
            self.streamer_listener,
            Role::Streamer,
            self.handle.clone(),
            self.keepalive,
        );
        let players = accept_loop(
            self.player_listener,
            Role::Player,
            self.handle,
            self.keepalive,
        );
        tokio::join!(streamers, players);
    }
}

fn bind_with_backlog(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn accept_loop(listener: TcpListener, role: Role, handle: RelayHandle, keepalive: Keepalive) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to accept {} connection: {}", role, e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        let handle = handle.clone();

        tokio::spawn(async move {
            let result = match role {
                Role::Streamer => handle_streamer_connection(stream, addr, handle, keepalive).await,
                Role::Player => handle_player_connection(stream, addr, handle, keepalive).await,
            };
            if let Err(e) = result {
                warn!("Connection error from {} {}: {}", role, addr, e);
            }
        });
    }
}

async fn handle_streamer_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: RelayHandle,
    keepalive: Keepalive,
) -> Result<(), tungstenite::Error> {
    let mut session = Session::accept(stream, addr, Role::Streamer, keepalive).await?;

    let streamer_id = match handle.connect_streamer(session.peer()).await {
        Ok(id) => id,
        Err(e) => {
            session.finish(Termination::Rejected(e)).await;
            return Ok(());
        }
    };

    let termination = loop {
        let text = match session.recv().await {
            Ok(text) => text,
            Err(termination) => break termination,
        };
        debug!("-> {}: {}", streamer_id, text);

        match parse_streamer_message(&text) {
            Ok(msg) => handle.streamer_message(streamer_id, msg).await,
            Err(e) => {
                warn!("{} sent an invalid message: {}", streamer_id, e);
                break Termination::Protocol(e);
            }
        }
    };

    handle.disconnect_streamer(streamer_id).await;
    session.finish(termination).await;
    Ok(())
}

async fn handle_player_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: RelayHandle,
    keepalive: Keepalive,
) -> Result<(), tungstenite::Error> {
    let mut session = Session::accept(stream, addr, Role::Player, keepalive).await?;

    let player_id = match handle.connect_player(session.peer()).await {
        Ok(id) => id,
        Err(e) => {
            session.finish(Termination::Rejected(e)).await;
            return Ok(());
        }
    };

    let termination = loop {
        let text = match session.recv().await {
            Ok(text) => text,
            Err(termination) => break termination,
        };
        debug!("-> player {}: {}", player_id, text);

        match parse_player_message(&text) {
            Ok(msg) => handle.player_message(player_id, msg).await,
            Err(e) => {
                warn!("Player {} sent an invalid message: {}", player_id, e);
                break Termination::Protocol(e);
            }
        }
    };

    handle.disconnect_player(player_id).await;
    session.finish(termination).await;
    Ok(())
}

/// Why a session ended.
#[derive(Debug)]
enum Termination {
    /// The peer sent a close frame or the stream ended.
    Closed(Option<CloseFrame>),
    Transport(tungstenite::Error),
    Protocol(ParseError),
    /// No pong within the keepalive timeout.
    Unresponsive,
    /// Our own writer stopped, usually after the relay closed the connection.
    WriterGone,
    Rejected(RelayError),
}

impl Termination {
    /// Close frame to send back, if the transport is still usable.
    fn reply(&self) -> Option<(CloseCode, String)> {
        match self {
            Termination::Closed(_) => Some((CloseCode::Normal, String::new())),
            Termination::Protocol(e) => Some((CloseCode::Policy, e.close_reason().to_string())),
            Termination::Rejected(RelayError::NoStreamer) => {
                Some((CloseCode::Again, "Streamer is not connected".to_string()))
            }
            Termination::Rejected(RelayError::StreamerAlreadyConnected) => {
                Some((CloseCode::Again, "Streamer already connected".to_string()))
            }
            Termination::Rejected(RelayError::Internal(_)) => {
                Some((CloseCode::Error, "Internal error".to_string()))
            }
            Termination::Transport(_) | Termination::Unresponsive | Termination::WriterGone => None,
        }
    }

    /// Close code the session is recorded with.
    fn code(&self) -> CloseCode {
        match self {
            Termination::Closed(Some(frame)) => frame.code,
            Termination::Closed(None) => CloseCode::Status,
            other => other
                .reply()
                .map(|(code, _)| code)
                .unwrap_or(CloseCode::Abnormal),
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Closed(Some(frame)) if !frame.reason.is_empty() => {
                write!(f, "closed by peer: {}", frame.reason.as_str())
            }
            Termination::Closed(_) => f.write_str("closed by peer"),
            Termination::Transport(e) => write!(f, "transport error: {}", e),
            Termination::Protocol(e) => write!(f, "protocol violation: {}", e),
            Termination::Unresponsive => f.write_str("pong timeout"),
            Termination::WriterGone => f.write_str("connection closed by relay"),
            Termination::Rejected(e) => write!(f, "rejected: {}", e),
        }
    }
}

/// One accepted WebSocket connection: a receive loop on this task and a writer task
/// draining the connection's outbound queue.
struct Session {
    addr: SocketAddr,
    role: Role,
    ws_rx: SplitStream<WebSocketStream<TcpStream>>,
    peer: PeerHandle,
    send_task: JoinHandle<()>,
    ping_interval: Interval,
    pong_timeout: Duration,
    pong_deadline: Option<Instant>,
}

impl Session {
    async fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        role: Role,
        keepalive: Keepalive,
    ) -> Result<Self, tungstenite::Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_tx, ws_rx) = ws_stream.split();

        info!("WebSocket connection from {} {}", role, addr);

        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = msg.is_close();
                if ws_tx.send(msg.into_message()).await.is_err() || closing {
                    break;
                }
            }
        });

        let mut ping_interval = tokio::time::interval_at(
            Instant::now() + keepalive.ping_interval,
            keepalive.ping_interval,
        );
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            addr,
            role,
            ws_rx,
            peer: PeerHandle::new(addr, tx),
            send_task,
            ping_interval,
            pong_timeout: keepalive.pong_timeout,
            pong_deadline: None,
        })
    }

    fn peer(&self) -> PeerHandle {
        self.peer.clone()
    }

    /// Wait for the next data frame, answering keepalive traffic on the way.
    async fn recv(&mut self) -> Result<String, Termination> {
        loop {
            let pong_deadline = self.pong_deadline;
            let pong_timeout = async move {
                match pong_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.ping_interval.tick() => {
                    if !self.peer.send(OutboundMessage::Ping) {
                        return Err(Termination::WriterGone);
                    }
                    if self.pong_deadline.is_none() {
                        self.pong_deadline = Some(Instant::now() + self.pong_timeout);
                    }
                    debug!("Ping sent to {} {}", self.role, self.addr);
                }

                _ = pong_timeout => return Err(Termination::Unresponsive),

                msg = self.ws_rx.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return Err(Termination::Transport(e)),
                        None => return Err(Termination::Closed(None)),
                    };

                    match msg {
                        Message::Text(text) => return Ok(text.as_str().to_owned()),
                        Message::Binary(data) => {
                            return std::str::from_utf8(&data)
                                .map(str::to_owned)
                                .map_err(|_| Termination::Protocol(ParseError::NotUtf8));
                        }
                        Message::Pong(_) => {
                            self.pong_deadline = None;
                            debug!("Pong received from {} {}", self.role, self.addr);
                        }
                        Message::Close(frame) => return Err(Termination::Closed(frame)),
                        Message::Ping(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    /// Send the closing frame (if any) and wait for the writer to flush it.
    async fn finish(self, termination: Termination) {
        let code = u16::from(termination.code());
        match &termination {
            Termination::Closed(_) => {
                info!("{} {} disconnected ({}): {}", self.role, self.addr, code, termination)
            }
            _ => warn!("{} {} disconnected ({}): {}", self.role, self.addr, code, termination),
        }

        let abort = self.send_task.abort_handle();
        match termination.reply() {
            Some((code, reason)) => {
                self.peer.close(code, reason);
            }
            None => abort.abort(),
        }
        drop(self.peer);

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, self.send_task)
            .await
            .is_err()
        {
            debug!("Writer for {} {} did not finish, aborting", self.role, self.addr);
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::Utf8Bytes;

    fn parse_error() -> ParseError {
        parse_player_message("not json").unwrap_err()
    }

    #[test]
    fn protocol_violation_closes_with_policy() {
        let termination = Termination::Protocol(parse_error());
        assert_eq!(
            termination.reply(),
            Some((CloseCode::Policy, "Cannot parse".to_string()))
        );
        assert_eq!(u16::from(termination.code()), 1008);
    }

    #[test]
    fn missing_streamer_closes_with_try_again() {
        let termination = Termination::Rejected(RelayError::NoStreamer);
        assert_eq!(u16::from(termination.code()), 1013);
        assert_eq!(termination.reply().unwrap().1, "Streamer is not connected");
    }

    #[test]
    fn transport_failure_is_abnormal_and_sends_nothing() {
        let termination = Termination::Unresponsive;
        assert!(termination.reply().is_none());
        assert_eq!(u16::from(termination.code()), 1006);
    }

    #[test]
    fn peer_close_keeps_peer_code() {
        let termination = Termination::Closed(Some(CloseFrame {
            code: CloseCode::Away,
            reason: Utf8Bytes::from_static("bye"),
        }));
        assert_eq!(u16::from(termination.code()), 1001);
        assert_eq!(termination.to_string(), "closed by peer: bye");
    }

    #[test]
    fn role_display() {
        assert_eq!(Role::Streamer.to_string(), "streamer");
        assert_eq!(Role::Player.to_string(), "player");
    }
}
