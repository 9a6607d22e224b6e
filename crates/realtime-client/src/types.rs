//! Public states, events, and the crate error type.

use tokio_tungstenite::tungstenite;

/// Boxed error type accepted from user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Connection lifecycle. `Connecting` covers dialing plus the protocol
/// handshake; `Connected` means the handshake result has been received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Per-channel lifecycle. `Subscribing` means the subscribe command is in
/// flight; a rejected subscribe falls back to `Unsubscribed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// Delivered once per successful handshake.
#[derive(Debug, Clone)]
pub struct ConnectEvent {
    /// Server-assigned connection id.
    pub client_id: String,
    /// Server software version.
    pub version: String,
}

/// Delivered once per connection teardown, with the code/reason pair that
/// caused it.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub code: u32,
    pub reason: String,
}

/// A publication received on a subscribed channel.
#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub data: serde_json::Value,
    /// Position in the channel history stream, when the server tracks one.
    pub offset: Option<u64>,
    /// Originating client, when the server attaches it.
    pub info: Option<crate::protocol::ClientInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel name must not be empty")]
    InvalidChannel,

    #[error("a subscription to channel {0:?} already exists")]
    DuplicateSubscription(String),

    #[error("subscription already active")]
    AlreadySubscribed,

    #[error("unsubscribed before the subscribe completed")]
    Unsubscribed,

    #[error("client already connected")]
    AlreadyConnected,

    #[error("client not connected")]
    NotConnected,

    #[error("server error: code={code}, {message}")]
    Server {
        code: u32,
        message: String,
        temporary: bool,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl From<crate::protocol::ErrorInfo> for Error {
    fn from(err: crate::protocol::ErrorInfo) -> Self {
        Self::Server {
            code: err.code,
            message: err.message,
            temporary: err.temporary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorInfo, error_code};

    #[test]
    fn server_error_display() {
        let err = Error::from(ErrorInfo {
            code: error_code::PERMISSION_DENIED,
            message: "permission denied".to_string(),
            temporary: false,
        });
        assert_eq!(err.to_string(), "server error: code=103, permission denied");
    }

    #[test]
    fn error_info_conversion_keeps_fields() {
        let err = Error::from(ErrorInfo {
            code: error_code::TOO_MANY_REQUESTS,
            message: "slow down".to_string(),
            temporary: true,
        });
        match err {
            Error::Server {
                code,
                message,
                temporary,
            } => {
                assert_eq!(code, 111);
                assert_eq!(message, "slow down");
                assert!(temporary);
            }
            other => panic!("expected Server error, got {other:?}"),
        }
    }
}
