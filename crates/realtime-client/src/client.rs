//! Client handle, connection ownership, and callback dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::connection::{
    self, ConnEvent, ConnRequest, DEFAULT_PING_INTERVAL, EventLoopState, REQUEST_CHANNEL_CAPACITY,
};
use crate::protocol::{self, Command, Reply, disconnect_code};
use crate::subscription::{Subscription, SubscriptionShared};
use crate::types::{
    BoxError, ClientState, ConnectEvent, DisconnectEvent, Error, SubscriptionState,
};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Put a callback back into its slot after an invocation, unless the callback
/// replaced itself while it ran.
pub(crate) fn reinstall<T>(slot: &Mutex<Option<T>>, callback: T) {
    let mut slot = lock(slot);
    if slot.is_none() {
        *slot = Some(callback);
    }
}

pub(crate) type ConnectCallback = Box<dyn FnMut(ConnectEvent) -> Result<(), BoxError> + Send>;
pub(crate) type DisconnectCallback = Box<dyn FnMut(DisconnectEvent) + Send>;

enum ConnSlot {
    Idle,
    Active(ConnHandle),
}

struct ConnHandle {
    req_tx: mpsc::Sender<ConnRequest>,
    state_rx: watch::Receiver<ClientState>,
    dispatcher: Option<JoinHandle<()>>,
}

/// State shared between the [`Client`] handle, its subscriptions, and the
/// dispatch task.
pub(crate) struct ClientShared {
    config: ClientConfig,
    conn: Mutex<ConnSlot>,
    on_connect: Mutex<Option<ConnectCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    subs: Mutex<HashMap<String, Arc<SubscriptionShared>>>,
}

impl ClientShared {
    fn conn_channels(&self) -> Option<(mpsc::Sender<ConnRequest>, watch::Receiver<ClientState>)> {
        match &*lock(&self.conn) {
            ConnSlot::Active(handle) => Some((handle.req_tx.clone(), handle.state_rx.clone())),
            ConnSlot::Idle => None,
        }
    }

    pub(crate) fn state(&self) -> ClientState {
        match &*lock(&self.conn) {
            ConnSlot::Active(handle) => *handle.state_rx.borrow(),
            ConnSlot::Idle => ClientState::Disconnected,
        }
    }

    /// Send one command and wait for its reply, bounded by the request
    /// timeout. When the connection is still being established this waits
    /// out the handshake first, so commands never race it.
    pub(crate) async fn request(&self, command: Command) -> Result<Reply, Error> {
        let (req_tx, state_rx) = self.conn_channels().ok_or(Error::NotConnected)?;
        timeout(self.config.timing.request_timeout, async move {
            connection::wait_connected(state_rx).await?;
            let (reply_tx, reply_rx) = oneshot::channel();
            req_tx
                .send(ConnRequest::Command { command, reply_tx })
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            reply_rx.await.map_err(|_| Error::ConnectionClosed)
        })
        .await
        .map_err(|_| Error::Timeout)?
    }

    /// Ask the connection task to tear down, without waiting for it.
    pub(crate) async fn request_close(&self, code: u32, reason: String) {
        let req_tx = match &*lock(&self.conn) {
            ConnSlot::Active(handle) => handle.req_tx.clone(),
            ConnSlot::Idle => return,
        };
        let _ = req_tx
            .send(ConnRequest::Close {
                code,
                reason,
                ack_tx: None,
            })
            .await;
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        if let ConnSlot::Active(handle) = &*lock(&self.conn) {
            let _ = handle.req_tx.try_send(ConnRequest::Close {
                code: disconnect_code::CLOSED_BY_CLIENT,
                reason: "client dropped".to_string(),
                ack_tx: None,
            });
        }
    }
}

/// Handle to one realtime connection. Cheap to clone; all clones share the
/// same connection and subscription registry.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Validate the configuration and build a disconnected client.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let parsed = url::Url::parse(&config.url)?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::Config(format!(
                    "unsupported URL scheme {other:?}, expected ws or wss"
                )));
            }
        }
        Ok(Self {
            shared: Arc::new(ClientShared {
                config,
                conn: Mutex::new(ConnSlot::Idle),
                on_connect: Mutex::new(None),
                on_disconnect: Mutex::new(None),
                subs: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Dial the server and start the connection. Returns once the transport
    /// is up; the protocol handshake completes in the background and flips
    /// the state to [`ClientState::Connected`], firing the connect callback.
    pub async fn connect(&self) -> Result<(), Error> {
        let timing = self.shared.config.timing.clone();
        let (req_tx, req_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ClientState::Connecting);

        {
            let mut slot = lock(&self.shared.conn);
            if let ConnSlot::Active(handle) = &*slot
                && *handle.state_rx.borrow() != ClientState::Disconnected
            {
                return Err(Error::AlreadyConnected);
            }
            *slot = ConnSlot::Active(ConnHandle {
                req_tx: req_tx.clone(),
                state_rx,
                dispatcher: None,
            });
        }

        tracing::info!(url = %self.shared.config.url, "connecting");
        let dial = connection::connect_and_split(&self.shared.config.url);
        let (ws_write, ws_read) = match timeout(timing.connect_timeout, dial).await {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                self.clear_conn(&req_tx);
                return Err(e);
            }
            Err(_) => {
                self.clear_conn(&req_tx);
                return Err(Error::Timeout);
            }
        };

        let (event_tx, event_rx) = mpsc::channel(timing.event_channel_capacity);
        let connect_cmd = protocol::build_connect(
            self.shared.config.token.clone(),
            &self.shared.config.name,
            &self.shared.config.version,
        );
        let state = EventLoopState {
            ws_read,
            ws_write,
            event_tx,
            state_tx,
            timing,
            next_id: 0,
            pending: HashMap::new(),
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_required: true,
            last_frame_at: tokio::time::Instant::now(),
            dropped_publications: 0,
        };
        tokio::spawn(connection::run_event_loop(state, req_rx, connect_cmd));
        let dispatcher = tokio::spawn(run_dispatcher(Arc::downgrade(&self.shared), event_rx));

        // close() may have taken the slot while we were dialing; only attach
        // the dispatcher handle if this connection still owns it.
        let mut slot = lock(&self.shared.conn);
        if let ConnSlot::Active(handle) = &mut *slot
            && handle.req_tx.same_channel(&req_tx)
        {
            handle.dispatcher = Some(dispatcher);
        }
        Ok(())
    }

    fn clear_conn(&self, req_tx: &mpsc::Sender<ConnRequest>) {
        let mut slot = lock(&self.shared.conn);
        if let ConnSlot::Active(handle) = &*slot
            && handle.req_tx.same_channel(req_tx)
        {
            *slot = ConnSlot::Idle;
        }
    }

    /// Close the connection and wait until the disconnect callback has run.
    /// Does nothing when already disconnected.
    pub async fn close(&self) {
        let handle = {
            let mut slot = lock(&self.shared.conn);
            match std::mem::replace(&mut *slot, ConnSlot::Idle) {
                ConnSlot::Active(handle) => handle,
                ConnSlot::Idle => return,
            }
        };
        let request_timeout = self.shared.config.timing.request_timeout;
        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = handle
            .req_tx
            .send(ConnRequest::Close {
                code: disconnect_code::CLOSED_BY_CLIENT,
                reason: "client closed connection".to_string(),
                ack_tx: Some(ack_tx),
            })
            .await
            .is_ok();
        if sent {
            let _ = timeout(request_timeout, ack_rx).await;
        }
        if let Some(dispatcher) = handle.dispatcher {
            let _ = timeout(request_timeout, dispatcher).await;
        }
        tracing::info!("client closed");
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Register the channel with this client and return its subscription
    /// handle. Each channel gets at most one subscription per client.
    pub fn new_subscription(&self, channel: impl Into<String>) -> Result<Subscription, Error> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(Error::InvalidChannel);
        }
        let mut subs = lock(&self.shared.subs);
        if subs.contains_key(&channel) {
            return Err(Error::DuplicateSubscription(channel));
        }
        let sub = Arc::new(SubscriptionShared::new(channel.clone()));
        subs.insert(channel, sub.clone());
        Ok(Subscription::new(self.shared.clone(), sub))
    }

    /// Called after each successful handshake. Returning an error closes the
    /// connection.
    pub fn on_connect(
        &self,
        callback: impl FnMut(ConnectEvent) -> Result<(), BoxError> + Send + 'static,
    ) {
        *lock(&self.shared.on_connect) = Some(Box::new(callback));
    }

    /// Called once per connection teardown, whatever caused it.
    pub fn on_disconnect(&self, callback: impl FnMut(DisconnectEvent) + Send + 'static) {
        *lock(&self.shared.on_disconnect) = Some(Box::new(callback));
    }
}

/// Pull events off the connection and run user callbacks, away from the
/// socket task. Holds only a weak reference so dropped handles still tear
/// everything down.
async fn run_dispatcher(shared: Weak<ClientShared>, mut event_rx: mpsc::Receiver<ConnEvent>) {
    while let Some(event) = event_rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            ConnEvent::Connected(info) => {
                // Callbacks run with their slot unlocked so a handler can
                // re-register itself from inside its own invocation.
                let callback = lock(&shared.on_connect).take();
                let result = match callback {
                    Some(mut callback) => {
                        let result = callback(info);
                        reinstall(&shared.on_connect, callback);
                        result
                    }
                    None => Ok(()),
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "connect handler failed, closing connection");
                    shared
                        .request_close(
                            disconnect_code::CONNECT_REJECTED,
                            format!("connect handler error: {e}"),
                        )
                        .await;
                }
            }
            ConnEvent::Disconnected(info) => {
                // Subscription states reset before the callback runs, so the
                // callback observes the settled picture.
                for sub in lock(&shared.subs).values() {
                    sub.set_state(SubscriptionState::Unsubscribed);
                }
                let callback = lock(&shared.on_disconnect).take();
                if let Some(mut callback) = callback {
                    callback(info);
                    reinstall(&shared.on_disconnect, callback);
                }
            }
            ConnEvent::Publication { channel, event } => {
                let sub = lock(&shared.subs).get(&channel).cloned();
                match sub {
                    Some(sub) if sub.state() != SubscriptionState::Unsubscribed => {
                        sub.deliver(event);
                    }
                    Some(_) => {
                        tracing::trace!(%channel, "dropping publication for inactive subscription");
                    }
                    None => tracing::debug!(%channel, "publication for unknown channel"),
                }
            }
            ConnEvent::Unsubscribed {
                channel,
                code,
                reason,
            } => {
                let sub = lock(&shared.subs).get(&channel).cloned();
                if let Some(sub) = sub {
                    sub.set_state(SubscriptionState::Unsubscribed);
                }
                tracing::info!(%channel, code, %reason, "subscription removed by server");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_URL;

    #[test]
    fn reinstall_keeps_replacement() {
        let slot: Mutex<Option<u32>> = Mutex::new(None);
        reinstall(&slot, 1);
        assert_eq!(*lock(&slot), Some(1));
        *lock(&slot) = Some(2);
        reinstall(&slot, 1);
        assert_eq!(*lock(&slot), Some(2));
    }

    #[test]
    fn new_rejects_non_websocket_scheme() {
        let config = ClientConfig::new("http://localhost:8000/connection/websocket");
        let err = Client::new(config).map(|_| ()).unwrap_err();
        match err {
            Error::Config(msg) => assert!(msg.contains("http")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn new_rejects_unparsable_url() {
        let config = ClientConfig::new("not a url");
        let err = Client::new(config).map(|_| ()).unwrap_err();
        match err {
            Error::Url(_) => {}
            other => panic!("expected Url error, got {other:?}"),
        }
    }

    #[test]
    fn state_reports_disconnected_before_connect() {
        let client = Client::new(ClientConfig::new(DEFAULT_URL)).unwrap();
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn new_subscription_rejects_empty_channel() {
        let client = Client::new(ClientConfig::new(DEFAULT_URL)).unwrap();
        match client.new_subscription("") {
            Err(Error::InvalidChannel) => {}
            Err(other) => panic!("expected InvalidChannel, got {other:?}"),
            Ok(_) => panic!("expected InvalidChannel, got a subscription"),
        }
    }

    #[test]
    fn new_subscription_rejects_duplicate_channel() {
        let client = Client::new(ClientConfig::new(DEFAULT_URL)).unwrap();
        let _sub = client.new_subscription("chat").unwrap();
        match client.new_subscription("chat") {
            Err(Error::DuplicateSubscription(channel)) => assert_eq!(channel, "chat"),
            Err(other) => panic!("expected DuplicateSubscription, got {other:?}"),
            Ok(_) => panic!("expected DuplicateSubscription, got a subscription"),
        }
    }
}
