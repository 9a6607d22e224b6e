//! Chat-style demo: subscribes to a channel, prints what arrives, and
//! publishes a message every few seconds until interrupted.
//!
//! ```text
//! cargo run --example chat
//! ```
//!
//! Environment:
//! - `REALTIME_SERVER_URL`: WebSocket endpoint (default
//!   `ws://localhost:8000/connection/websocket`).
//! - `REALTIME_TOKEN`: connection token, if the server requires one.

use realtime_client::{Client, ClientConfig, DEFAULT_URL};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let url = std::env::var("REALTIME_SERVER_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let mut config = ClientConfig::new(url);
    config.token = std::env::var("REALTIME_TOKEN").ok();

    let client = Client::new(config)?;
    client.on_connect(|info| {
        eprintln!(
            "[connected] client={} server={}",
            info.client_id, info.version
        );
        Ok(())
    });
    client.on_disconnect(|info| {
        eprintln!("[disconnected] code={} reason={}", info.code, info.reason);
    });
    if let Err(e) = client.connect().await {
        eprintln!("[connect failed] {e}");
        return Err(e.into());
    }

    let sub = client.new_subscription("chat")?;
    sub.on_publish(|event| println!("{}", event.data));
    sub.subscribe().await?;
    eprintln!("[subscribed] chat");

    let publisher = {
        let sub = sub.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                let message = serde_json::json!({
                    "text": format!("hello at {}", chrono::Utc::now().to_rfc3339()),
                });
                if let Err(e) = sub.publish(message).await {
                    eprintln!("[publish failed] {e}");
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    eprintln!("[shutting down]");
    publisher.abort();
    if let Err(e) = sub.unsubscribe().await {
        eprintln!("[unsubscribe failed] {e}");
    }
    client.close().await;
    Ok(())
}
