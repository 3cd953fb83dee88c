//! Default WebSocket transport: JSON-encoded [`Frame`]s over
//! `tokio-tungstenite`.
//!
//! One connect spawns two pump tasks — a writer serializing outbound
//! frames onto the socket and a reader decoding inbound ones. The reader
//! dropping its sender is what ends the pipe, which the core treats as a
//! disconnect. Frames that fail to decode are logged and skipped rather
//! than killing the connection.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::transport::{FRAME_CHANNEL_CAPACITY, Frame, Transport, TransportAuth, TransportPipe};
use crate::types::Error;

const PROTOCOL_VERSION: &str = "1";
const AGENT_STRING: &str = "realtime-client-rs/0.1";

/// WebSocket connector for a fixed endpoint (`ws://` or `wss://`).
pub struct WsTransport {
    endpoint: String,
}

impl WsTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into() }
    }
}

fn build_ws_url(
    endpoint: &str,
    auth: &TransportAuth,
    resume: Option<&str>,
) -> Result<String, Error> {
    let mut u = url::Url::parse(endpoint).map_err(|e| Error::Transport(Box::new(e)))?;
    {
        let mut q = u.query_pairs_mut();
        q.append_pair("access_token", &auth.token.token);
        q.append_pair("v", PROTOCOL_VERSION);
        q.append_pair("agent", AGENT_STRING);
        q.append_pair("format", "json");
        q.append_pair("heartbeats", "true");
        if let Some(ref client_id) = auth.client_id {
            q.append_pair("client_id", client_id);
        }
        if let Some(key) = resume {
            q.append_pair("resume", key);
        }
    }
    Ok(u.to_string())
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        auth: TransportAuth,
        resume: Option<String>,
    ) -> Result<TransportPipe, Error> {
        let ws_url = build_ws_url(&self.endpoint, &auth, resume.as_deref())?;
        let (ws, _resp) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| Error::Transport(Box::new(e)))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);

        // Writer: ends when the core drops its outbound sender.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("failed to encode frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(tungstenite::Message::Text(text.into())).await {
                    tracing::info!("websocket send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: dropping `in_tx` ends the pipe and signals disconnect.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let decoded = match frame {
                    Ok(tungstenite::Message::Text(text)) => {
                        serde_json::from_str::<Frame>(text.as_str())
                    }
                    Ok(tungstenite::Message::Binary(data)) => {
                        serde_json::from_slice::<Frame>(&data)
                    }
                    Ok(tungstenite::Message::Close(_)) => break,
                    Ok(_) => continue, // ping/pong
                    Err(e) => {
                        tracing::info!("websocket receive failed: {e}");
                        break;
                    }
                };
                match decoded {
                    Ok(frame) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("failed to decode frame: {e}"),
                }
            }
        });

        Ok(TransportPipe { outbound: out_tx, inbound: in_rx })
    }
}
