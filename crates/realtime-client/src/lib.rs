//! Realtime publish/subscribe client core.
//!
//! One connection per client, driven by a background state machine;
//! any number of named channels multiplexed over it, each with its own
//! attach state and subscribers; non-blocking listener delivery ordered
//! per channel; token-based auth supplied asynchronously by the caller.
//!
//! # Features
//! - Explicit connection and channel state machines with listeners on
//!   every transition
//! - Automatic reconnection with capped, jittered exponential backoff and
//!   connection resume
//! - Proactive token renewal before expiry, invisible to callers
//! - Heartbeat-based liveness detection
//! - Configurable publish behavior while disconnected (queue or fail fast)
//! - Pluggable transport; a WebSocket transport is included
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), realtime_client::Error> {
//! use std::sync::Arc;
//! use realtime_client::{ClientConfig, Realtime, WsTransport};
//!
//! let transport = Arc::new(WsTransport::new("wss://realtime.example.com/"));
//! let config = ClientConfig::new(
//!     transport,
//!     Box::new(|| Box::pin(async { todo!("fetch a token from your server") })),
//! );
//!
//! let client = Realtime::new(config);
//! client.on_state_change(|state| println!("connection: {state}"));
//! client.connect();
//!
//! let room = client.channel("room1");
//! room.subscribe(|msg| println!("got {}: {:?}", msg.name, msg.data));
//! room.publish("ping", &b"1"[..])?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod client;
mod connection;
mod dispatcher;
mod state;
mod transport;
mod types;
mod ws;

pub use channel::Channel;
pub use client::Realtime;
pub use state::{ChannelState, ConnectionState};
pub use transport::{
    ErrorInfo, FRAME_CHANNEL_CAPACITY, Frame, Transport, TransportAuth, TransportPipe, error_code,
};
pub use types::{
    BoxError, ClientConfig, Error, ListenerHandle, Message, PublishPolicy, TimingConfig, Token,
    TokenFuture, TokenProvider,
};
pub use ws::WsTransport;
