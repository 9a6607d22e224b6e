//! Client configuration.

use std::time::Duration;

/// Default endpoint used by the examples when no URL is configured.
pub const DEFAULT_URL: &str = "ws://localhost:8000/connection/websocket";

/// Everything a [`crate::Client`] needs to dial and identify itself. The
/// library itself reads no environment variables; callers resolve their own
/// settings and pass them in here.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub url: String,
    /// Client name reported in the handshake.
    pub name: String,
    /// Client version reported in the handshake.
    pub version: String,
    /// Connection token passed through verbatim, if the server wants one.
    pub token: Option<String>,
    pub timing: TimingConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: "realtime-client-rs".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            token: None,
            timing: TimingConfig::default(),
        }
    }
}

/// Timeouts and channel sizing.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Bound applied to the transport dial, and again to the protocol
    /// handshake behind it.
    pub connect_timeout: Duration,
    /// Bound on each id-correlated request, including any wait for the
    /// handshake to finish first.
    pub request_timeout: Duration,
    /// Grace added to the server-announced ping interval before the
    /// connection is declared dead.
    pub ping_margin: Duration,
    /// Capacity of the queue carrying events to user callbacks.
    pub event_channel_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            ping_margin: Duration::from_secs(10),
            event_channel_capacity: 64,
        }
    }
}
