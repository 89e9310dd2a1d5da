//! Connects to an echo server, sends a few messages and prints what comes back.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=debug,rustls=off cargo run --example echo --features tracing -- wss://echo.websocket.org
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use textsock::{CancellationToken, Client, Config};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());

    let config = Config::builder().initial_buffer_size(64).build();
    let client = Client::new(config)?;
    client.add_header("User-Agent", "textsock-echo")?;

    client.on_opened(|| info!("connection opened"));
    client.on_closed(|| info!("connection closed"));
    client.on_error(|e, context| error!(?context, error = %e, "receive loop failed"));

    let messages = client.messages();
    let mut messages = Box::pin(messages);

    // Ctrl-C cancels the connection, which closes it gracefully.
    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    client.connect(&url, Some(shutdown)).await?;

    for text in ["hello", "a somewhat longer message that will not fit in 64 bytes at once"] {
        client.send(text).await?;
    }

    loop {
        match tokio::time::timeout(Duration::from_secs(5), messages.next()).await {
            Ok(Some(Ok(text))) => info!(%text, "received"),
            Ok(Some(Err(e))) => warn!(error = %e, "missed messages"),
            Ok(None) => break,
            Err(_elapsed) => {
                info!("no more messages, disconnecting");
                client.disconnect().await?;
            }
        }
    }

    Ok(())
}
