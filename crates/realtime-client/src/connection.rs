//! Connection management: event loop, reconnection, and token renewal.
//!
//! One background task per client owns the transport and every
//! connection-level state transition. Callers talk to it through
//! [`Command`]s; it never blocks them on network I/O. The loop shape is:
//! wait for `connect()`, then alternate between establishing a connection
//! (token fetch → transport connect → handshake) and running it (frames,
//! commands, renewal and liveness timers), with a capped, jittered
//! exponential backoff between attempts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channel::Outbound;
use crate::client::Shared;
use crate::dispatcher::{DispatchQueue, ListenerSet};
use crate::state::{ChannelState, ConnectionState};
use crate::transport::{ErrorInfo, Frame, Transport, TransportAuth, TransportPipe, error_code};
use crate::types::{Error, ListenerHandle, Message, PublishPolicy, TimingConfig, Token, TokenProvider};

// ---------------------------------------------------------------------------
// Commands from the facade and channel handles
// ---------------------------------------------------------------------------

pub(crate) enum Command {
    Connect,
    Close,
    Attach(String),
    Detach(String),
    Flush(String),
}

// ---------------------------------------------------------------------------
// Shared connection state + listeners
// ---------------------------------------------------------------------------

pub(crate) struct ConnShared {
    state: Mutex<ConnectionState>,
    listeners: ListenerSet<ConnectionState>,
    queue: DispatchQueue,
}

impl ConnShared {
    /// Must be called within a Tokio runtime (spawns the dispatch task).
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Initialized),
            listeners: ListenerSet::new(),
            queue: DispatchQueue::new("connection"),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a transition if the edge is valid. The notification is
    /// enqueued under the state lock, so listeners observe transitions in
    /// the order they occurred.
    pub fn transition(&self, to: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_transition(to) {
            return false;
        }
        tracing::debug!(from = %*state, to = %to, "connection state change");
        *state = to;
        self.listeners.notify(&self.queue, to);
        true
    }

    pub fn on_state_change(
        &self,
        f: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.listeners.add(f)
    }

    pub fn off_state_change(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }
}

// ---------------------------------------------------------------------------
// Retriability (server error info)
// ---------------------------------------------------------------------------

/// An error is retriable when it has no status code, is a server error
/// (5xx), or carries a well-known connection error code even at 4xx.
fn is_retriable(err: &ErrorInfo) -> bool {
    const CONNECTION_ERROR_CODES: &[i32] = &[
        error_code::DISCONNECTED,
        error_code::SUSPENDED,
        error_code::FAILED,
        error_code::CLOSED,
        error_code::UNKNOWN_CONNECTION_ERR,
        error_code::UNKNOWN_CHANNEL_ERR,
    ];
    match err.status_code {
        None => true,
        Some(sc) if sc >= 500 => true,
        Some(_) => CONNECTION_ERROR_CODES.contains(&err.code),
    }
}

fn error_or_unknown(error: Option<ErrorInfo>) -> ErrorInfo {
    error.unwrap_or_else(|| ErrorInfo {
        code: error_code::FAILED,
        status_code: None,
        message: "no error details from server".to_string(),
    })
}

// ---------------------------------------------------------------------------
// Backoff and renewal timing
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Exponential backoff: initial, 2x, 4x, ... capped at the max interval,
/// plus up to 1s of jitter taken from the wall clock's subsecond nanos.
fn backoff_delay(timing: &TimingConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(30);
    let backoff = timing
        .initial_retry_interval
        .saturating_mul(1u32 << exp)
        .min(timing.max_retry_interval);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    backoff + Duration::from_millis(nanos % 1000)
}

/// When to proactively renew `token`. `None` disables renewal (token
/// carries no expiry metadata).
fn compute_renewal_at(token: &Token, timing: &TimingConfig) -> Option<Instant> {
    if token.expires <= 0 {
        return None;
    }
    let remaining_ms = (token.expires - now_epoch_ms()).max(0) as u64;
    let margin_ms = timing.token_renewal_margin.as_millis() as u64;
    Some(Instant::now() + Duration::from_millis(remaining_ms.saturating_sub(margin_ms)))
}

async fn renewal_sleep(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

// ---------------------------------------------------------------------------
// Per-connection bookkeeping that survives reconnects
// ---------------------------------------------------------------------------

struct ConnInfo {
    connection_id: Option<String>,
    resume_key: Option<String>,
    state_ttl: Duration,
    max_idle: Duration,
    disconnected_at: Option<Instant>,
    token: Option<Token>,
    renewal_at: Option<Instant>,
    renewal_failures: u32,
    /// Channels automatically re-attached after a spontaneous detach, with
    /// the time of the re-attach.
    reattach_at: HashMap<String, Instant>,
}

impl ConnInfo {
    fn new(timing: &TimingConfig) -> Self {
        Self {
            connection_id: None,
            resume_key: None,
            state_ttl: timing.default_connection_state_ttl,
            max_idle: timing.default_max_idle_interval,
            disconnected_at: None,
            token: None,
            renewal_at: None,
            renewal_failures: 0,
            reattach_at: HashMap::new(),
        }
    }

    fn apply_connected(
        &mut self,
        connection_id: String,
        resume_key: Option<String>,
        state_ttl_ms: Option<u64>,
        max_idle_ms: Option<u64>,
    ) {
        self.connection_id = Some(connection_id);
        if let Some(key) = resume_key {
            self.resume_key = Some(key);
        }
        if let Some(ttl) = state_ttl_ms {
            self.state_ttl = Duration::from_millis(ttl);
        }
        if let Some(idle) = max_idle_ms {
            self.max_idle = Duration::from_millis(idle);
        }
    }

    /// The resume key, if the drop is recent enough for the server to
    /// still hold connection state.
    fn resume_key_if_fresh(&self) -> Option<String> {
        let disconnected_at = self.disconnected_at?;
        if disconnected_at.elapsed() < self.state_ttl {
            self.resume_key.clone()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

pub(crate) struct EventLoopState {
    pub shared: Arc<Shared>,
    pub transport: Arc<dyn Transport>,
    pub get_token: TokenProvider,
    pub client_id: Option<String>,
    pub timing: TimingConfig,
}

pub(crate) async fn run_event_loop(p: EventLoopState, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    // Wait for the first connect() before doing any I/O.
    loop {
        match cmd_rx.recv().await {
            Some(Command::Connect) => break,
            Some(Command::Close) | None => {
                do_close(&p, None).await;
                return;
            }
            Some(cmd) => absorb_offline(&p, cmd),
        }
    }

    let mut info = ConnInfo::new(&p.timing);
    let mut attempts: u32 = 0;
    p.shared.conn.transition(ConnectionState::Connecting);

    loop {
        match establish(&p, &mut cmd_rx, &mut info).await {
            EstablishOutcome::Connected { outbound, mut inbound, resumed } => {
                attempts = 0;
                info.disconnected_at = None;
                p.shared.conn.transition(ConnectionState::Connected);
                resume_or_reattach(&p, &outbound, resumed).await;
                flush_all(&p, &outbound).await;
                match run_connected(&p, &mut cmd_rx, &mut info, &outbound, &mut inbound).await {
                    ConnectedExit::Shutdown => return,
                    ConnectedExit::Reconnect => {
                        info.disconnected_at = Some(Instant::now());
                        p.shared.conn.transition(ConnectionState::Disconnected);
                        park_channels(&p);
                        if p.shared.publish_policy == PublishPolicy::FailFast {
                            clear_all_pending(&p);
                        }
                    }
                }
            }
            EstablishOutcome::Closed => return,
            EstablishOutcome::Fatal(e) => {
                fail_connection(&p, &e);
                return;
            }
            EstablishOutcome::Retry(e) => {
                tracing::warn!("connection attempt failed: {e}");
                p.shared.conn.transition(ConnectionState::Disconnected);
                park_channels(&p);
            }
        }

        // Backoff gate, shared by failed attempts and dropped connections.
        attempts += 1;
        if attempts > p.timing.max_retry_attempts {
            let max = p.timing.max_retry_attempts;
            fail_connection(
                &p,
                &Error::Transport(format!("connection failed after {max} attempts").into()),
            );
            return;
        }
        if attempts > p.timing.suspend_after_attempts {
            p.shared.conn.transition(ConnectionState::Suspended);
        }
        match backoff_wait(&p, &mut cmd_rx, backoff_delay(&p.timing, attempts)).await {
            Wait::Close => {
                do_close(&p, None).await;
                return;
            }
            Wait::Proceed => {}
        }
        p.shared.conn.transition(ConnectionState::Connecting);
    }
}

// ---------------------------------------------------------------------------
// Establishing a connection (token -> transport -> handshake)
// ---------------------------------------------------------------------------

enum EstablishOutcome {
    Connected {
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<Frame>,
        resumed: bool,
    },
    /// Transient failure, retried per backoff.
    Retry(Error),
    /// Unrecoverable; the connection becomes failed.
    Fatal(Error),
    /// close() arrived mid-attempt; transitions already applied.
    Closed,
}

async fn establish(
    p: &EventLoopState,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    info: &mut ConnInfo,
) -> EstablishOutcome {
    let resume = info.resume_key_if_fresh();

    // Fresh connects get a fresh token; resumes reuse the current one.
    if resume.is_none() || info.token.is_none() {
        let fetch = tokio::time::timeout(p.timing.connect_timeout, (p.get_token)());
        match race_cmds(p, cmd_rx, fetch).await {
            Raced::Close => {
                do_close(p, None).await;
                return EstablishOutcome::Closed;
            }
            Raced::Done(Ok(Ok(token))) => {
                info.renewal_at = compute_renewal_at(&token, &p.timing);
                info.renewal_failures = 0;
                info.token = Some(token);
            }
            Raced::Done(Ok(Err(e))) => return EstablishOutcome::Retry(Error::Auth(e)),
            Raced::Done(Err(_)) => {
                return EstablishOutcome::Retry(Error::Transport("token fetch timed out".into()));
            }
        }
    }
    let Some(token) = info.token.clone() else {
        return EstablishOutcome::Retry(Error::Transport("no token available".into()));
    };

    let auth = TransportAuth { token, client_id: p.client_id.clone() };
    let transport = p.transport.clone();
    let resume_for_connect = resume.clone();
    let connect = tokio::time::timeout(p.timing.connect_timeout, async move {
        transport.connect(auth, resume_for_connect).await
    });
    let pipe = match race_cmds(p, cmd_rx, connect).await {
        Raced::Close => {
            do_close(p, None).await;
            return EstablishOutcome::Closed;
        }
        Raced::Done(Ok(Ok(pipe))) => pipe,
        Raced::Done(Ok(Err(e))) => return EstablishOutcome::Retry(e),
        Raced::Done(Err(_)) => {
            return EstablishOutcome::Retry(Error::Transport("transport connect timed out".into()));
        }
    };
    let TransportPipe { outbound, mut inbound } = pipe;

    // Handshake: the first meaningful frame must be Connected.
    let deadline = Instant::now() + p.timing.connect_timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, inbound.recv());
        match race_cmds(p, cmd_rx, next).await {
            Raced::Close => {
                do_close(p, Some(&outbound)).await;
                return EstablishOutcome::Closed;
            }
            Raced::Done(Ok(Some(Frame::Connected {
                connection_id,
                resume_key,
                connection_state_ttl_ms,
                max_idle_interval_ms,
            }))) => {
                let resumed = resume.is_some()
                    && info.connection_id.as_deref() == Some(connection_id.as_str());
                info.apply_connected(
                    connection_id,
                    resume_key,
                    connection_state_ttl_ms,
                    max_idle_interval_ms,
                );
                if resumed {
                    tracing::info!("connection resumed");
                }
                return EstablishOutcome::Connected { outbound, inbound, resumed };
            }
            Raced::Done(Ok(Some(Frame::Error { error })))
            | Raced::Done(Ok(Some(Frame::Disconnected { error: Some(error) }))) => {
                return if is_retriable(&error) {
                    EstablishOutcome::Retry(Error::Transport(error.message.into()))
                } else {
                    EstablishOutcome::Fatal(Error::Protocol {
                        code: error.code,
                        message: error.message,
                    })
                };
            }
            Raced::Done(Ok(Some(Frame::Disconnected { error: None }))) => {
                return EstablishOutcome::Retry(Error::Transport(
                    "disconnected during handshake".into(),
                ));
            }
            Raced::Done(Ok(Some(frame))) => {
                tracing::debug!(?frame, "ignoring pre-connected frame");
            }
            Raced::Done(Ok(None)) => {
                return EstablishOutcome::Retry(Error::Transport(
                    "connection closed during handshake".into(),
                ));
            }
            Raced::Done(Err(_)) => {
                return EstablishOutcome::Retry(Error::Transport("handshake timed out".into()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connected phase
// ---------------------------------------------------------------------------

enum ConnectedExit {
    Reconnect,
    Shutdown,
}

enum LoopAction {
    Continue,
    Reconnect,
    Stop,
    Renew,
}

async fn run_connected(
    p: &EventLoopState,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    info: &mut ConnInfo,
    outbound: &mpsc::Sender<Frame>,
    inbound: &mut mpsc::Receiver<Frame>,
) -> ConnectedExit {
    loop {
        let idle_deadline = Instant::now() + info.max_idle + p.timing.heartbeat_margin;
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => match handle_frame(p, info, outbound, frame).await {
                    LoopAction::Continue => {}
                    LoopAction::Reconnect => return ConnectedExit::Reconnect,
                    LoopAction::Stop => return ConnectedExit::Shutdown,
                    LoopAction::Renew => {
                        if let AfterRenewal::Shutdown = run_renewal(p, cmd_rx, info, outbound).await {
                            return ConnectedExit::Shutdown;
                        }
                    }
                },
                None => {
                    tracing::info!("transport stream ended");
                    return ConnectedExit::Reconnect;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Close) | None => {
                    do_close(p, Some(outbound)).await;
                    return ConnectedExit::Shutdown;
                }
                Some(cmd) => apply_cmd(p, outbound, cmd).await,
            },
            _ = renewal_sleep(info.renewal_at) => {
                if let AfterRenewal::Shutdown = run_renewal(p, cmd_rx, info, outbound).await {
                    return ConnectedExit::Shutdown;
                }
            },
            _ = tokio::time::sleep_until(idle_deadline) => {
                tracing::warn!("liveness timeout, treating connection as lost");
                return ConnectedExit::Reconnect;
            }
        }
    }
}

async fn handle_frame(
    p: &EventLoopState,
    info: &mut ConnInfo,
    outbound: &mpsc::Sender<Frame>,
    frame: Frame,
) -> LoopAction {
    match frame {
        Frame::Heartbeat => {
            tracing::trace!("heartbeat received");
            LoopAction::Continue
        }
        Frame::Message { channel, name, data, id, client_id, timestamp } => {
            match p.shared.registry.get(&channel) {
                Some(ch) => ch.deliver(Message { name, data, id, client_id, timestamp }),
                None => tracing::debug!(channel = %channel, "message for unknown channel"),
            }
            LoopAction::Continue
        }
        Frame::Attached { channel } => {
            if let Some(ch) = p.shared.registry.get(&channel) {
                ch.transition(ChannelState::Attached);
            }
            info.reattach_at.remove(&channel);
            LoopAction::Continue
        }
        Frame::Detached { channel, error } => {
            let Some(ch) = p.shared.registry.get(&channel) else {
                return LoopAction::Continue;
            };
            if ch.state() == ChannelState::Detaching {
                // Requested detach completed.
                ch.transition(ChannelState::Detached);
                return LoopAction::Continue;
            }
            let err = error_or_unknown(error);
            if !is_retriable(&err) {
                tracing::warn!(channel = %channel, code = err.code, "channel failed: {}", err.message);
                ch.transition(ChannelState::Failed);
                return LoopAction::Continue;
            }
            if info
                .reattach_at
                .get(&channel)
                .is_some_and(|at| at.elapsed() < p.timing.channel_retry_window)
            {
                tracing::warn!(channel = %channel, "channel detached again inside retry window, parking");
                ch.transition(ChannelState::Suspended);
                info.reattach_at.remove(&channel);
                return LoopAction::Continue;
            }
            tracing::warn!(channel = %channel, "channel detached, re-attaching");
            info.reattach_at.insert(channel.clone(), Instant::now());
            ch.transition(ChannelState::Detached);
            ch.transition(ChannelState::Attaching);
            let _ = outbound.send(Frame::Attach { channel }).await;
            LoopAction::Continue
        }
        Frame::Disconnected { error } => {
            if let Some(err) = error {
                if !is_retriable(&err) {
                    fail_connection(p, &Error::Protocol { code: err.code, message: err.message });
                    return LoopAction::Stop;
                }
                tracing::info!(code = err.code, "server disconnect: {}", err.message);
            } else {
                tracing::info!("server disconnect");
            }
            LoopAction::Reconnect
        }
        Frame::Error { error } => {
            fail_connection(p, &Error::Protocol { code: error.code, message: error.message });
            LoopAction::Stop
        }
        Frame::Closed => {
            tracing::info!("connection closed by server");
            p.shared.conn.transition(ConnectionState::Closing);
            detach_all_channels(p);
            p.shared.conn.transition(ConnectionState::Closed);
            LoopAction::Stop
        }
        Frame::Connected {
            connection_id,
            resume_key,
            connection_state_ttl_ms,
            max_idle_interval_ms,
        } => {
            info.apply_connected(connection_id, resume_key, connection_state_ttl_ms, max_idle_interval_ms);
            LoopAction::Continue
        }
        Frame::AuthRequired => {
            tracing::info!("server requested reauthentication");
            LoopAction::Renew
        }
        Frame::Attach { .. } | Frame::Detach { .. } | Frame::Close | Frame::Auth { .. } => {
            tracing::debug!("ignoring client-direction frame from server");
            LoopAction::Continue
        }
        Frame::Unknown => {
            tracing::debug!("ignoring unrecognized frame");
            LoopAction::Continue
        }
    }
}

// ---------------------------------------------------------------------------
// Token renewal
// ---------------------------------------------------------------------------

enum Renewal {
    Ok,
    /// Non-fatal failure; a retry is scheduled.
    Deferred,
    Close,
    Fatal(Error),
}

enum AfterRenewal {
    Continue,
    Shutdown,
}

async fn run_renewal(
    p: &EventLoopState,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    info: &mut ConnInfo,
    outbound: &mpsc::Sender<Frame>,
) -> AfterRenewal {
    match renew_token(p, cmd_rx, info, outbound).await {
        Renewal::Ok | Renewal::Deferred => AfterRenewal::Continue,
        Renewal::Close => {
            do_close(p, Some(outbound)).await;
            AfterRenewal::Shutdown
        }
        Renewal::Fatal(e) => {
            fail_connection(p, &e);
            AfterRenewal::Shutdown
        }
    }
}

/// Fetch a fresh token and send an auth frame, without surfacing any state
/// change. The fetch is raced against the command channel so close()
/// cancels it; other commands are deferred and replayed afterwards.
async fn renew_token(
    p: &EventLoopState,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    info: &mut ConnInfo,
    outbound: &mpsc::Sender<Frame>,
) -> Renewal {
    tracing::info!("renewing auth token");
    let fetch = tokio::time::timeout(p.timing.connect_timeout, (p.get_token)());
    tokio::pin!(fetch);
    let mut deferred: Vec<Command> = Vec::new();
    let result = loop {
        tokio::select! {
            out = &mut fetch => break out,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Close) | None => return Renewal::Close,
                Some(Command::Connect) => {}
                Some(cmd) => deferred.push(cmd),
            }
        }
    };
    let outcome = match result {
        Ok(Ok(token)) => {
            if outbound.send(Frame::Auth { token: token.clone() }).await.is_err() {
                tracing::warn!("transport gone before auth frame could be sent");
            }
            info.renewal_at = compute_renewal_at(&token, &p.timing);
            info.renewal_failures = 0;
            info.token = Some(token);
            tracing::info!("token renewed");
            Renewal::Ok
        }
        Ok(Err(e)) => renewal_failure(info, &p.timing, &format!("token renewal failed: {e}")),
        Err(_) => renewal_failure(info, &p.timing, "token renewal timed out"),
    };
    for cmd in deferred {
        apply_cmd(p, outbound, cmd).await;
    }
    outcome
}

fn renewal_failure(info: &mut ConnInfo, timing: &TimingConfig, reason: &str) -> Renewal {
    info.renewal_failures += 1;
    tracing::error!(
        "{reason} ({}/{})",
        info.renewal_failures,
        timing.max_token_renewal_failures,
    );
    if info.renewal_failures >= timing.max_token_renewal_failures {
        let max = timing.max_token_renewal_failures;
        Renewal::Fatal(Error::Auth(
            format!("token renewal failed {max} consecutive times").into(),
        ))
    } else {
        info.renewal_at = Some(Instant::now() + timing.token_renewal_retry_delay);
        Renewal::Deferred
    }
}

// ---------------------------------------------------------------------------
// Command plumbing
// ---------------------------------------------------------------------------

enum Raced<T> {
    Done(T),
    Close,
}

/// Drive `fut` while keeping the command channel live, so close() cancels
/// long-running awaits (token fetches, transport connects, handshakes).
/// Channel commands that arrive meanwhile are absorbed into channel state
/// and honored once connected.
async fn race_cmds<F: Future>(
    p: &EventLoopState,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    fut: F,
) -> Raced<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Raced::Done(out),
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Close) | None => return Raced::Close,
                Some(Command::Connect) => {}
                Some(cmd) => absorb_offline(p, cmd),
            }
        }
    }
}

/// Handle a channel command while no connection exists. Attach intent and
/// queued publishes already live in the channel; only detach needs to
/// complete locally.
fn absorb_offline(p: &EventLoopState, cmd: Command) {
    match cmd {
        Command::Detach(name) => {
            if let Some(ch) = p.shared.registry.get(&name)
                && ch.state() == ChannelState::Detaching
            {
                ch.transition(ChannelState::Detached);
            }
        }
        Command::Attach(_) | Command::Flush(_) | Command::Connect | Command::Close => {}
    }
}

/// Handle a channel command on a live connection.
async fn apply_cmd(p: &EventLoopState, outbound: &mpsc::Sender<Frame>, cmd: Command) {
    match cmd {
        Command::Attach(channel) => {
            let _ = outbound.send(Frame::Attach { channel }).await;
        }
        Command::Detach(channel) => {
            let _ = outbound.send(Frame::Detach { channel }).await;
        }
        Command::Flush(channel) => flush_channel(p, outbound, &channel).await,
        Command::Connect | Command::Close => {}
    }
}

enum Wait {
    Proceed,
    Close,
}

/// Sleep out the backoff, unless a command cuts it short: close() aborts,
/// a re-entrant connect() retries immediately.
async fn backoff_wait(
    p: &EventLoopState,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    delay: Duration,
) -> Wait {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Wait::Proceed,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Close) | None => return Wait::Close,
                Some(Command::Connect) => return Wait::Proceed,
                Some(cmd) => absorb_offline(p, cmd),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Channel sweeps
// ---------------------------------------------------------------------------

fn is_active(state: ChannelState) -> bool {
    matches!(
        state,
        ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended | ChannelState::Detaching
    )
}

/// Park live channels while the connection is down; they re-attach on the
/// next successful connect.
fn park_channels(p: &EventLoopState) {
    for ch in p.shared.registry.snapshot() {
        if matches!(ch.state(), ChannelState::Attaching | ChannelState::Attached) {
            ch.transition(ChannelState::Suspended);
        }
    }
}

fn detach_all_channels(p: &EventLoopState) {
    for ch in p.shared.registry.snapshot() {
        if is_active(ch.state()) {
            ch.transition(ChannelState::Detached);
        }
    }
}

fn clear_all_pending(p: &EventLoopState) {
    for ch in p.shared.registry.snapshot() {
        let dropped = ch.clear_pending();
        if dropped > 0 {
            tracing::warn!(channel = %ch.name(), dropped, "discarding queued publishes");
        }
    }
}

/// After connecting: restore attachments. A confirmed resume restores
/// suspended channels without wire traffic; a fresh connect re-attaches
/// them.
async fn resume_or_reattach(p: &EventLoopState, outbound: &mpsc::Sender<Frame>, resumed: bool) {
    for ch in p.shared.registry.snapshot() {
        match ch.state() {
            ChannelState::Attaching => {
                let _ = outbound.send(Frame::Attach { channel: ch.name().to_string() }).await;
            }
            ChannelState::Suspended => {
                ch.transition(ChannelState::Attaching);
                if resumed {
                    ch.transition(ChannelState::Attached);
                } else {
                    let _ = outbound.send(Frame::Attach { channel: ch.name().to_string() }).await;
                }
            }
            ChannelState::Detaching => {
                let _ = outbound.send(Frame::Detach { channel: ch.name().to_string() }).await;
            }
            _ => {}
        }
    }
}

/// Drain one channel's queued publishes onto the wire, in order.
async fn flush_channel(p: &EventLoopState, outbound: &mpsc::Sender<Frame>, name: &str) {
    if p.shared.conn.state() != ConnectionState::Connected {
        return;
    }
    let Some(ch) = p.shared.registry.get(name) else {
        return;
    };
    while let Some(out) = ch.pop_pending() {
        let frame = Frame::Message {
            channel: ch.name().to_string(),
            name: out.name,
            data: out.data,
            id: None,
            client_id: p.client_id.clone(),
            timestamp: None,
        };
        if let Err(e) = outbound.send(frame).await {
            // Transport went away mid-flush; requeue and let the retry
            // path handle it.
            if let mpsc::error::SendError(Frame::Message { name, data, .. }) = e {
                ch.requeue_front(Outbound { name, data });
            }
            break;
        }
    }
}

async fn flush_all(p: &EventLoopState, outbound: &mpsc::Sender<Frame>) {
    for ch in p.shared.registry.snapshot() {
        flush_channel(p, outbound, ch.name()).await;
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

async fn do_close(p: &EventLoopState, outbound: Option<&mpsc::Sender<Frame>>) {
    tracing::info!("close requested");
    if let Some(outbound) = outbound {
        let _ = outbound.send(Frame::Close).await;
    }
    p.shared.conn.transition(ConnectionState::Closing);
    detach_all_channels(p);
    p.shared.conn.transition(ConnectionState::Closed);
}

/// Report an unrecoverable failure exactly once and fail live channels.
fn fail_connection(p: &EventLoopState, err: &Error) {
    tracing::error!("connection failed: {err}");
    if p.shared.conn.transition(ConnectionState::Failed) {
        for ch in p.shared.registry.snapshot() {
            if is_active(ch.state()) {
                ch.transition(ChannelState::Failed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
