//! Public types: messages, tokens, configuration, and errors.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::transport::Transport;

/// A boxed error type for token provider callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A future that resolves to a fresh [`Token`].
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<Token, BoxError>> + Send>>;

/// Callback that produces a fresh [`Token`] on demand.
///
/// Invoked for the initial connection, on proactive renewal before expiry,
/// and when the server requests reauthentication. May be called any number
/// of times over the life of a client.
pub type TokenProvider = Box<dyn Fn() -> TokenFuture + Send + Sync>;

/// A short-lived credential used to authenticate a connection attempt.
///
/// `expires`/`issued` are milliseconds since the Unix epoch. A token with
/// `expires <= 0` is treated as non-expiring and disables proactive renewal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub token: String,
    #[serde(default)]
    pub expires: i64,
    #[serde(default)]
    pub issued: i64,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// A message received from (or published to) a channel.
#[derive(Debug, Clone)]
pub struct Message {
    /// Event name (e.g. "ping", "status").
    pub name: String,
    /// Opaque binary payload.
    pub data: Bytes,
    /// Unique message ID, when assigned by the server.
    pub id: Option<String>,
    /// Publisher's client ID.
    pub client_id: Option<String>,
    /// Server timestamp (milliseconds since epoch).
    pub timestamp: Option<i64>,
}

impl Message {
    /// Build a message carrying just an event name and payload.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            id: None,
            client_id: None,
            timestamp: None,
        }
    }
}

/// Opaque token identifying one listener registration.
///
/// Returned by every `subscribe`/`on_state_change` call; passing it back to
/// the matching unsubscribe method removes exactly that registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_handle() -> ListenerHandle {
    ListenerHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

/// What to do with a publish while the connection is not connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishPolicy {
    /// Queue the message and flush it, in order, once connected.
    #[default]
    QueueUntilConnected,
    /// Return [`Error::NotConnected`] synchronously.
    FailFast,
}

/// Timing knobs for connection management.
///
/// Defaults are production values; tests override them for fast,
/// deterministic runs.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Timeout applied to token fetches, transport connects, and the
    /// post-connect handshake.
    pub connect_timeout: Duration,
    /// First retry delay after a connection failure.
    pub initial_retry_interval: Duration,
    /// Cap on the exponential retry delay.
    pub max_retry_interval: Duration,
    /// Consecutive failed attempts before the connection becomes failed.
    pub max_retry_attempts: u32,
    /// Consecutive failed attempts before the connection is reported
    /// suspended (retries continue at the capped interval).
    pub suspend_after_attempts: u32,
    /// How long before token expiry a proactive renewal fires.
    pub token_renewal_margin: Duration,
    /// Delay before retrying a failed token renewal.
    pub token_renewal_retry_delay: Duration,
    /// Consecutive renewal failures before the connection fails.
    pub max_token_renewal_failures: u32,
    /// Grace added on top of the server's max idle interval before the
    /// connection is considered lost.
    pub heartbeat_margin: Duration,
    /// Max idle interval assumed until the server advertises one.
    pub default_max_idle_interval: Duration,
    /// Resume window assumed until the server advertises one.
    pub default_connection_state_ttl: Duration,
    /// Window after an automatic channel re-attach during which a second
    /// spontaneous detach parks the channel until the next connection cycle.
    pub channel_retry_window: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            initial_retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(15),
            max_retry_attempts: 40,
            suspend_after_attempts: 8,
            token_renewal_margin: Duration::from_secs(300),
            token_renewal_retry_delay: Duration::from_secs(30),
            max_token_renewal_failures: 3,
            heartbeat_margin: Duration::from_secs(10),
            default_max_idle_interval: Duration::from_secs(15),
            default_connection_state_ttl: Duration::from_secs(120),
            channel_retry_window: Duration::from_secs(15),
        }
    }
}

/// Configuration for [`Realtime::new`](crate::Realtime::new).
pub struct ClientConfig {
    /// Transport used to reach the server.
    pub transport: Arc<dyn Transport>,
    /// Callback that returns a fresh [`Token`].
    pub get_token: TokenProvider,
    /// Client identity attached to outgoing publishes and the transport
    /// handshake.
    pub client_id: Option<String>,
    /// Publish behavior while disconnected.
    pub publish_policy: PublishPolicy,
    /// Timing overrides.
    pub timing: TimingConfig,
}

impl ClientConfig {
    pub fn new(transport: Arc<dyn Transport>, get_token: TokenProvider) -> Self {
        Self {
            transport,
            get_token,
            client_id: None,
            publish_policy: PublishPolicy::default(),
            timing: TimingConfig::default(),
        }
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network-level failure; retried internally per the backoff policy.
    #[error("transport error: {0}")]
    Transport(BoxError),

    /// Token fetch failed or was rejected; retried with a fresh token.
    #[error("auth error: {0}")]
    Auth(BoxError),

    /// Unrecoverable server behavior; surfaces as the failed state.
    #[error("protocol error: code={code}, {message}")]
    Protocol { code: i32, message: String },

    /// Publish refused under the fail-fast policy or after teardown.
    #[error("not connected")]
    NotConnected,

    /// Programming error at the call site; reported synchronously.
    #[error("caller misuse: {0}")]
    CallerMisuse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_json_round_trip() {
        let token = Token {
            token: "app.tok-abc123".to_string(),
            expires: 1_700_003_600_000,
            issued: 1_700_000_000_000,
            client_id: Some("client-1".to_string()),
        };
        let json = serde_json::to_string(&token).unwrap();
        assert!(json.contains("clientId"));
        let parsed: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.token, "app.tok-abc123");
        assert_eq!(parsed.expires, 1_700_003_600_000);
    }

    #[test]
    fn token_missing_optional_fields() {
        let parsed: Token = serde_json::from_str(r#"{"token":"t"}"#).unwrap();
        assert_eq!(parsed.token, "t");
        assert_eq!(parsed.expires, 0);
        assert!(parsed.client_id.is_none());
    }

    #[test]
    fn listener_handles_are_unique() {
        let a = next_handle();
        let b = next_handle();
        assert_ne!(a, b);
    }

    #[test]
    fn timing_defaults() {
        let t = TimingConfig::default();
        assert!(t.initial_retry_interval < t.max_retry_interval);
        assert!(t.suspend_after_attempts < t.max_retry_attempts);
        assert!(t.token_renewal_margin > Duration::ZERO);
    }
}
