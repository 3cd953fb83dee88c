//! Test support: a scripted in-memory transport plus recording helpers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use realtime_client::{
    Error, Frame, TimingConfig, Token, TokenProvider, Transport, TransportAuth, TransportPipe,
};
use tokio::sync::mpsc;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A token expiring far enough out that proactive renewal never fires
/// inside a test.
pub fn long_token(value: &str) -> Token {
    Token {
        token: value.to_string(),
        expires: now_ms() + 86_400_000,
        issued: now_ms(),
        client_id: None,
    }
}

/// Provider that hands out `tokens` in order (sticking on the last one)
/// and counts invocations.
pub fn provider_with(tokens: Vec<Token>) -> (TokenProvider, Arc<AtomicU32>) {
    assert!(!tokens.is_empty());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let tokens = Arc::new(tokens);
    let provider: TokenProvider = Box::new(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
        let tokens = tokens.clone();
        Box::pin(async move {
            let last = tokens.len() - 1;
            Ok(tokens.get(n.min(last)).cloned().unwrap())
        })
    });
    (provider, calls)
}

pub fn static_provider() -> TokenProvider {
    provider_with(vec![long_token("tok-static")]).0
}

/// Small intervals so reconnect tests converge quickly under paused time.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        connect_timeout: Duration::from_secs(2),
        initial_retry_interval: Duration::from_millis(10),
        max_retry_interval: Duration::from_millis(50),
        heartbeat_margin: Duration::from_millis(500),
        ..TimingConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

/// Server end of one accepted connection.
pub struct ServerConn {
    pub to_client: mpsc::Sender<Frame>,
    pub from_client: mpsc::Receiver<Frame>,
    pub auth: TransportAuth,
    pub resume: Option<String>,
}

impl ServerConn {
    /// Complete the handshake by announcing a connection identity.
    pub async fn handshake(&self, conn_id: &str) {
        self.handshake_with_idle(conn_id, 60_000).await;
    }

    /// Handshake advertising a custom max idle interval.
    pub async fn handshake_with_idle(&self, conn_id: &str, max_idle_ms: u64) {
        self.send(Frame::Connected {
            connection_id: conn_id.to_string(),
            resume_key: Some(format!("{conn_id}!key")),
            connection_state_ttl_ms: Some(120_000),
            max_idle_interval_ms: Some(max_idle_ms),
        })
        .await;
    }

    pub async fn send(&self, frame: Frame) {
        self.to_client.send(frame).await.expect("client pipe closed");
    }

    pub async fn send_message(&self, channel: &str, name: &str, data: &'static [u8]) {
        self.send(Frame::Message {
            channel: channel.to_string(),
            name: name.to_string(),
            data: data.into(),
            id: None,
            client_id: None,
            timestamp: Some(now_ms()),
        })
        .await;
    }

    /// Next frame from the client, failing the test on timeout.
    pub async fn recv(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client pipe closed")
    }
}

/// In-memory transport: every connect surfaces a [`ServerConn`] on the
/// listener side, unless scripted to fail.
pub struct FakeTransport {
    accept_tx: mpsc::UnboundedSender<ServerConn>,
    fail_connects: AtomicU32,
    connects: AtomicU32,
}

pub struct FakeListener {
    accept_rx: mpsc::UnboundedReceiver<ServerConn>,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, FakeListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                accept_tx,
                fail_connects: AtomicU32::new(0),
                connects: AtomicU32::new(0),
            }),
            FakeListener { accept_rx },
        )
    }

    /// Fail the next `n` connect attempts with a transport error.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        auth: TransportAuth,
        resume: Option<String>,
    ) -> Result<TransportPipe, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transport("connection refused".into()));
        }
        let (client, server) = TransportPipe::pair();
        let conn = ServerConn {
            to_client: server.outbound,
            from_client: server.inbound,
            auth,
            resume,
        };
        self.accept_tx
            .send(conn)
            .map_err(|_| Error::Transport("listener gone".into()))?;
        Ok(client)
    }
}

impl FakeListener {
    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(Duration::from_secs(5), self.accept_rx.recv())
            .await
            .expect("timed out waiting for a connect attempt")
            .expect("transport dropped")
    }
}

// ---------------------------------------------------------------------------
// Recording listeners
// ---------------------------------------------------------------------------

/// Thread-safe event log for listener callbacks.
#[derive(Clone)]
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T: Clone + Send + 'static> Recorder<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn record(&self, value: T) {
        self.0.lock().unwrap().push(value);
    }

    pub fn items(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }

    /// Poll until the recorded items satisfy `pred`, failing the test
    /// after a timeout. Returns the items at that point.
    pub async fn wait_for(&self, pred: impl Fn(&[T]) -> bool) -> Vec<T> {
        let log = self.0.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                {
                    let items = log.lock().unwrap();
                    if pred(&items) {
                        return items.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("recorder condition not reached in time")
    }
}
