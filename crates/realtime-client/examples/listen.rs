//! Listen-only demo: subscribes to a channel and prints every publication,
//! data to stdout and everything else to stderr.
//!
//! ```text
//! cargo run --example listen -- my-channel
//! ```
//!
//! Environment as in the `chat` example.

use realtime_client::{Client, ClientConfig, DEFAULT_URL};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let channel = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "chat".to_string());
    let url = std::env::var("REALTIME_SERVER_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let mut config = ClientConfig::new(url);
    config.token = std::env::var("REALTIME_TOKEN").ok();

    let client = Client::new(config)?;
    client.on_connect(|info| {
        eprintln!("[connected] client={}", info.client_id);
        Ok(())
    });
    client.on_disconnect(|info| {
        eprintln!("[disconnected] code={} reason={}", info.code, info.reason);
    });
    if let Err(e) = client.connect().await {
        eprintln!("[connect failed] {e}");
        return Err(e.into());
    }

    let sub = client.new_subscription(channel)?;
    sub.on_publish(|event| {
        if let Some(offset) = event.offset {
            eprintln!("[offset {offset}]");
        }
        println!("{}", event.data);
    });
    sub.subscribe().await?;
    eprintln!("[subscribed] {}", sub.channel());

    tokio::signal::ctrl_c().await?;
    eprintln!("[shutting down]");
    if let Err(e) = sub.unsubscribe().await {
        eprintln!("[unsubscribe failed] {e}");
    }
    client.close().await;
    Ok(())
}
