//! Transport plumbing and the connection event loop.
//!
//! One task per connection owns both halves of the WebSocket, assigns command
//! ids, matches replies to their waiters, answers server pings, and watches
//! the ping deadline. Everything else talks to it through channels.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::TimingConfig;
use crate::protocol::{self, Command, ConnectResult, Push, Reply, disconnect_code, error_code};
use crate::types::{ClientState, ConnectEvent, DisconnectEvent, Error, PublishEvent};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Assumed server ping interval until the handshake result announces one.
pub(crate) const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Capacity of the request queue into the connection task.
pub(crate) const REQUEST_CHANNEL_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsRead = SplitStream<WsStream>;
pub(crate) type WsWrite = SplitSink<WsStream, Message>;

/// What the rest of the crate asks the connection task to do.
#[derive(Debug)]
pub(crate) enum ConnRequest {
    /// Send an id-correlated command; the reply lands on `reply_tx`.
    Command {
        command: Command,
        reply_tx: oneshot::Sender<Reply>,
    },
    /// Tear the connection down with this code/reason. `ack_tx` fires once
    /// the disconnect event has been queued.
    Close {
        code: u32,
        reason: String,
        ack_tx: Option<oneshot::Sender<()>>,
    },
}

/// What the connection task reports back for callback dispatch.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    Connected(ConnectEvent),
    Disconnected(DisconnectEvent),
    Publication { channel: String, event: PublishEvent },
    Unsubscribed { channel: String, code: u32, reason: String },
}

/// Mutable state owned by the connection task.
pub(crate) struct EventLoopState {
    pub ws_read: WsRead,
    pub ws_write: WsWrite,
    pub event_tx: mpsc::Sender<ConnEvent>,
    pub state_tx: watch::Sender<ClientState>,
    pub timing: TimingConfig,
    pub next_id: u32,
    pub pending: HashMap<u32, oneshot::Sender<Reply>>,
    pub ping_interval: Duration,
    pub pong_required: bool,
    pub last_frame_at: Instant,
    pub dropped_publications: u64,
}

impl EventLoopState {
    fn apply_connect_result(&mut self, result: &ConnectResult) {
        if result.ping > 0 {
            self.ping_interval = Duration::from_secs(u64::from(result.ping));
        }
        self.pong_required = result.pong;
    }
}

// ---------------------------------------------------------------------------
// Connection setup
// ---------------------------------------------------------------------------

pub(crate) async fn connect_and_split(url: &str) -> Result<(WsWrite, WsRead), Error> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    let (ws_write, ws_read) = ws.split();
    Ok((ws_write, ws_read))
}

/// Block until the watched connection state settles out of `Connecting`.
pub(crate) async fn wait_connected(
    mut state_rx: watch::Receiver<ClientState>,
) -> Result<(), Error> {
    loop {
        match *state_rx.borrow_and_update() {
            ClientState::Connected => return Ok(()),
            ClientState::Disconnected => return Err(Error::NotConnected),
            ClientState::Connecting => {}
        }
        if state_rx.changed().await.is_err() {
            return Err(Error::NotConnected);
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Drive one connection from handshake to teardown.
///
/// Runs the protocol handshake (bounded by `connect_timeout`), then processes
/// socket frames and queued requests until something ends the connection.
/// Exactly one `Disconnected` event is emitted, last, with a non-empty
/// reason.
pub(crate) async fn run_event_loop(
    mut p: EventLoopState,
    mut req_rx: mpsc::Receiver<ConnRequest>,
    connect_cmd: Command,
) {
    let connect_result =
        tokio::time::timeout(p.timing.connect_timeout, handshake(&mut p, connect_cmd)).await;
    let (mut event, close_ack) = match connect_result {
        Ok(Ok(result)) => {
            p.apply_connect_result(&result);
            let _ = p.state_tx.send(ClientState::Connected);
            tracing::info!(
                client_id = %result.client,
                ping_interval_s = result.ping,
                "connection established"
            );
            let _ = p
                .event_tx
                .send(ConnEvent::Connected(ConnectEvent {
                    client_id: result.client,
                    version: result.version,
                }))
                .await;
            p.last_frame_at = Instant::now();
            process_frames(&mut p, &mut req_rx).await
        }
        Ok(Err(Error::Server { code, message, .. })) => (
            DisconnectEvent {
                code: disconnect_code::CONNECT_REJECTED,
                reason: format!("connect rejected: code={code}, {message}"),
            },
            None,
        ),
        Ok(Err(e)) => (
            DisconnectEvent {
                code: disconnect_code::TRANSPORT_ERROR,
                reason: format!("handshake failed: {e}"),
            },
            None,
        ),
        Err(_) => (
            DisconnectEvent {
                code: disconnect_code::TRANSPORT_ERROR,
                reason: "handshake timed out".to_string(),
            },
            None,
        ),
    };

    p.pending.clear();

    // Late requests must not leave their callers hanging. Closing the queue
    // and draining it fires any close acks and drops command reply channels,
    // which surfaces ConnectionClosed to the waiters.
    req_rx.close();
    while let Ok(req) = req_rx.try_recv() {
        if let ConnRequest::Close {
            ack_tx: Some(tx), ..
        } = req
        {
            let _ = tx.send(());
        }
    }

    if event.reason.is_empty() {
        event.reason = "connection closed by server".to_string();
    }
    let _ = p.state_tx.send(ClientState::Disconnected);
    tracing::info!(code = event.code, reason = %event.reason, "disconnected");
    if p.dropped_publications > 0 {
        tracing::warn!(
            dropped = p.dropped_publications,
            "publications dropped on full event queue"
        );
    }
    let _ = p.event_tx.send(ConnEvent::Disconnected(event)).await;
    if let Some(tx) = close_ack {
        let _ = tx.send(());
    }
}

/// Send the connect command and wait for its reply, ignoring anything else
/// the server emits in the meantime.
async fn handshake(p: &mut EventLoopState, mut cmd: Command) -> Result<ConnectResult, Error> {
    p.next_id += 1;
    cmd.id = p.next_id;
    let id = cmd.id;
    let json = protocol::encode_command(&cmd)?;
    p.ws_write.send(Message::Text(json.into())).await?;

    loop {
        let Some(frame) = p.ws_read.next().await else {
            return Err(Error::ConnectionClosed);
        };
        match frame? {
            Message::Text(text) => {
                for reply in protocol::decode_reply_frame(text.as_str())? {
                    if reply.id != id {
                        tracing::debug!(id = reply.id, "ignoring reply before connect completed");
                        continue;
                    }
                    if let Some(err) = reply.error {
                        return Err(err.into());
                    }
                    return reply.connect.ok_or_else(|| Error::Server {
                        code: error_code::INTERNAL,
                        message: "connect reply missing result".to_string(),
                        temporary: false,
                    });
                }
            }
            Message::Close(_) => return Err(Error::ConnectionClosed),
            _ => {}
        }
    }
}

/// Returns the disconnect event that ended the connection, plus the ack
/// channel when a close request ended it.
async fn process_frames(
    p: &mut EventLoopState,
    req_rx: &mut mpsc::Receiver<ConnRequest>,
) -> (DisconnectEvent, Option<oneshot::Sender<()>>) {
    loop {
        let ping_deadline = p.last_frame_at + p.ping_interval + p.timing.ping_margin;
        tokio::select! {
            frame = p.ws_read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    p.last_frame_at = Instant::now();
                    let replies = match protocol::decode_reply_frame(text.as_str()) {
                        Ok(replies) => replies,
                        Err(e) => {
                            tracing::warn!(error = %e, "discarding undecodable frame");
                            continue;
                        }
                    };
                    for reply in replies {
                        if let Some(event) = handle_reply(p, reply).await {
                            return (event, None);
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (u32::from(u16::from(f.code)), f.reason.to_string()),
                        None => (disconnect_code::CONNECTION_CLOSED, String::new()),
                    };
                    tracing::debug!(code, "close frame received");
                    return (DisconnectEvent { code, reason }, None);
                }
                Some(Ok(_)) => p.last_frame_at = Instant::now(),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "transport failure");
                    return (
                        DisconnectEvent {
                            code: disconnect_code::TRANSPORT_ERROR,
                            reason: format!("transport error: {e}"),
                        },
                        None,
                    );
                }
                None => {
                    return (
                        DisconnectEvent {
                            code: disconnect_code::CONNECTION_CLOSED,
                            reason: String::new(),
                        },
                        None,
                    );
                }
            },
            req = req_rx.recv() => match req {
                Some(ConnRequest::Command { command, reply_tx }) => {
                    if let Err(e) = send_request(p, command, reply_tx).await {
                        tracing::warn!(error = %e, "failed to send command");
                        return (
                            DisconnectEvent {
                                code: disconnect_code::TRANSPORT_ERROR,
                                reason: format!("transport error: {e}"),
                            },
                            None,
                        );
                    }
                }
                Some(ConnRequest::Close { code, reason, ack_tx }) => {
                    tracing::debug!(code, "close requested");
                    let _ = p.ws_write.send(Message::Close(None)).await;
                    return (DisconnectEvent { code, reason }, ack_tx);
                }
                None => {
                    let _ = p.ws_write.send(Message::Close(None)).await;
                    return (
                        DisconnectEvent {
                            code: disconnect_code::CLOSED_BY_CLIENT,
                            reason: "client dropped".to_string(),
                        },
                        None,
                    );
                }
            },
            _ = tokio::time::sleep_until(ping_deadline) => {
                tracing::warn!("server ping overdue, dropping connection");
                return (
                    DisconnectEvent {
                        code: disconnect_code::NO_PING,
                        reason: "no ping from server".to_string(),
                    },
                    None,
                );
            }
        }
    }
}

async fn handle_reply(p: &mut EventLoopState, reply: Reply) -> Option<DisconnectEvent> {
    if reply.id > 0 {
        let id = reply.id;
        match p.pending.remove(&id) {
            Some(reply_tx) => {
                let _ = reply_tx.send(reply);
            }
            None => tracing::debug!(id, "reply for unknown request id"),
        }
        return None;
    }
    if reply.is_ping() {
        tracing::trace!("server ping");
        if p.pong_required
            && let Err(e) = send_pong(p).await
        {
            return Some(DisconnectEvent {
                code: disconnect_code::TRANSPORT_ERROR,
                reason: format!("transport error: {e}"),
            });
        }
        return None;
    }
    if let Some(push) = reply.push {
        return handle_push(p, push).await;
    }
    tracing::debug!("ignoring unrecognized frame from server");
    None
}

async fn handle_push(p: &mut EventLoopState, push: Push) -> Option<DisconnectEvent> {
    if let Some(publication) = push.publication {
        let event = PublishEvent {
            data: publication.data,
            offset: publication.offset,
            info: publication.info,
        };
        // Publications use try_send so a slow callback cannot stall the
        // socket reader. The status events below are rare and
        // ordering-sensitive, so they use awaited sends instead.
        match p.event_tx.try_send(ConnEvent::Publication {
            channel: push.channel,
            event,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                p.dropped_publications += 1;
                tracing::warn!(
                    total_dropped = p.dropped_publications,
                    "event queue full, dropping publication"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Some(DisconnectEvent {
                    code: disconnect_code::CLOSED_BY_CLIENT,
                    reason: "client closed connection".to_string(),
                });
            }
        }
        return None;
    }
    if let Some(unsubscribe) = push.unsubscribe {
        tracing::info!(
            channel = %push.channel,
            code = unsubscribe.code,
            "server removed subscription"
        );
        let _ = p
            .event_tx
            .send(ConnEvent::Unsubscribed {
                channel: push.channel,
                code: unsubscribe.code,
                reason: unsubscribe.reason,
            })
            .await;
        return None;
    }
    if let Some(disconnect) = push.disconnect {
        return Some(DisconnectEvent {
            code: disconnect.code,
            reason: disconnect.reason,
        });
    }
    tracing::debug!(channel = %push.channel, "ignoring unrecognized push");
    None
}

async fn send_request(
    p: &mut EventLoopState,
    mut command: Command,
    reply_tx: oneshot::Sender<Reply>,
) -> Result<(), Error> {
    // A caller that hit its request timeout dropped the receiver; sweep
    // those entries instead of carrying them until teardown.
    p.pending.retain(|_, tx| !tx.is_closed());
    p.next_id += 1;
    command.id = p.next_id;
    let json = protocol::encode_command(&command)?;
    p.pending.insert(command.id, reply_tx);
    tracing::debug!(id = command.id, "sending command");
    p.ws_write.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn send_pong(p: &mut EventLoopState) -> Result<(), Error> {
    let json = protocol::encode_command(&Command::default())?;
    p.ws_write.send(Message::Text(json.into())).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
