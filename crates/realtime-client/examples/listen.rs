//! Connect to a realtime endpoint and print messages from one channel.
//!
//! ```sh
//! REALTIME_TOKEN=<token> cargo run -p realtime-client --example listen \
//!     -- <ENDPOINT> <CHANNEL>
//! ```
//!
//! `ENDPOINT` is a `ws://` or `wss://` URL. The token is passed through
//! as-is with no expiry metadata, so proactive renewal stays off.

use std::sync::Arc;

use realtime_client::{ClientConfig, Realtime, Token, WsTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let endpoint = args.first().ok_or("usage: listen <ENDPOINT> <CHANNEL>")?.clone();
    let channel_name = args.get(1).ok_or("usage: listen <ENDPOINT> <CHANNEL>")?.clone();
    let token = std::env::var("REALTIME_TOKEN").map_err(|_| "REALTIME_TOKEN is not set")?;

    let mut config = ClientConfig::new(
        Arc::new(WsTransport::new(endpoint)),
        Box::new(move || {
            let token = token.clone();
            Box::pin(async move { Ok(Token { token, ..Default::default() }) })
        }),
    );
    config.client_id = Some(format!("listen-{}", std::process::id()));

    let client = Realtime::new(config);
    client.on_state_change(|state| tracing::info!("connection state: {state}"));
    client.connect();

    let channel = client.channel(&channel_name);
    channel.on_state_change(|state| tracing::info!("channel state: {state}"));
    channel.subscribe(|msg| {
        println!("{}: {}", msg.name, String::from_utf8_lossy(&msg.data));
    });

    std::future::pending::<()>().await;
    Ok(())
}
