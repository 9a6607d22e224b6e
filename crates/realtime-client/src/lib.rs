//! Realtime pub/sub client speaking an id-correlated command/reply protocol
//! over WebSocket.
//!
//! Features:
//! - Explicit connection and subscription lifecycles with observable states.
//! - Callbacks dispatched off the socket task, so a slow handler never
//!   stalls the protocol.
//! - Server ping / client pong liveness checking with a configurable grace
//!   margin.
//! - Per-request timeouts, with replies matched to commands by id.
//!
//! # Example
//!
//! ```no_run
//! use realtime_client::{Client, ClientConfig};
//!
//! # async fn example() -> Result<(), realtime_client::Error> {
//! let mut config = ClientConfig::new("ws://localhost:8000/connection/websocket");
//! config.token = Some("secret".to_string());
//!
//! let client = Client::new(config)?;
//! client.on_connect(|info| {
//!     println!("connected as {}", info.client_id);
//!     Ok(())
//! });
//! client.on_disconnect(|info| println!("disconnected: {} ({})", info.reason, info.code));
//! client.connect().await?;
//!
//! let sub = client.new_subscription("chat")?;
//! sub.on_publish(|event| println!("received: {}", event.data));
//! sub.subscribe().await?;
//! sub.publish(serde_json::json!({"text": "hello"})).await?;
//!
//! sub.unsubscribe().await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
pub mod protocol;
mod subscription;
mod types;

pub use client::Client;
pub use config::{ClientConfig, DEFAULT_URL, TimingConfig};
pub use subscription::Subscription;
pub use types::{
    BoxError, ClientState, ConnectEvent, DisconnectEvent, Error, PublishEvent, SubscriptionState,
};
