//! Transport seam: typed protocol frames and the connector trait.
//!
//! The core never touches sockets or byte formats. A [`Transport`]
//! produces a [`TransportPipe`] — a pair of in-memory channels carrying
//! typed [`Frame`]s — and owns whatever encoding and I/O sit behind it.
//! [`WsTransport`](crate::ws::WsTransport) is the shipped implementation;
//! tests drive the core through a scripted transport.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{Error, Token};

/// Capacity of each direction of a [`TransportPipe`].
pub const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Well-known error codes carried in [`ErrorInfo`].
pub mod error_code {
    pub const BAD_REQUEST: i32 = 40000;
    pub const UNKNOWN_CHANNEL_ERR: i32 = 50001;
    pub const UNKNOWN_CONNECTION_ERR: i32 = 50002;
    pub const FAILED: i32 = 80000;
    pub const SUSPENDED: i32 = 80002;
    pub const DISCONNECTED: i32 = 80003;
    pub const TIMEOUT: i32 = 80014;
    pub const CLOSED: i32 = 80017;
}

/// Error details attached to server frames.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ErrorInfo {
    pub code: i32,
    pub status_code: Option<u16>,
    pub message: String,
}

/// One protocol frame, in either direction.
///
/// Unrecognized actions from the wire decode to [`Frame::Unknown`] and are
/// ignored by the core rather than being guessed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Frame {
    Heartbeat,
    Connected {
        connection_id: String,
        #[serde(default)]
        resume_key: Option<String>,
        #[serde(default)]
        connection_state_ttl_ms: Option<u64>,
        #[serde(default)]
        max_idle_interval_ms: Option<u64>,
    },
    Disconnected {
        #[serde(default)]
        error: Option<ErrorInfo>,
    },
    Close,
    Closed,
    Error {
        error: ErrorInfo,
    },
    Attach {
        channel: String,
    },
    Attached {
        channel: String,
    },
    Detach {
        channel: String,
    },
    Detached {
        channel: String,
        #[serde(default)]
        error: Option<ErrorInfo>,
    },
    Message {
        channel: String,
        name: String,
        data: Bytes,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Auth {
        token: Token,
    },
    AuthRequired,
    #[serde(other)]
    Unknown,
}

/// Credentials handed to a transport for one connection attempt.
#[derive(Debug, Clone)]
pub struct TransportAuth {
    pub token: Token,
    pub client_id: Option<String>,
}

/// Duplex frame stream for one established transport connection.
///
/// `inbound` ends (returns `None`) when the underlying connection is gone;
/// the core treats that as a disconnect and runs its retry path.
pub struct TransportPipe {
    /// Client → server frames.
    pub outbound: mpsc::Sender<Frame>,
    /// Server → client frames.
    pub inbound: mpsc::Receiver<Frame>,
}

impl TransportPipe {
    /// A connected pair of pipes: the first is the client end, the second
    /// the server end (server `outbound` feeds client `inbound` and vice
    /// versa). Used by in-memory transports and tests.
    pub fn pair() -> (TransportPipe, TransportPipe) {
        let (client_tx, server_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (server_tx, client_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        (
            TransportPipe { outbound: client_tx, inbound: client_rx },
            TransportPipe { outbound: server_tx, inbound: server_rx },
        )
    }
}

/// Connector for one transport kind.
///
/// `resume` carries the previous connection's resume key when the core is
/// trying to recover a recently dropped connection; transports that cannot
/// resume may ignore it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        auth: TransportAuth,
        resume: Option<String>,
    ) -> Result<TransportPipe, Error>;
}
