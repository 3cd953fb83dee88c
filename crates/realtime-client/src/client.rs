//! Public entry point: the [`Realtime`] client.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelRegistry};
use crate::connection::{Command, ConnShared, EventLoopState, run_event_loop};
use crate::state::ConnectionState;
use crate::types::{ClientConfig, ListenerHandle, PublishPolicy};

/// State shared between the facade, channel handles, and the event loop.
pub(crate) struct Shared {
    pub conn: ConnShared,
    pub registry: ChannelRegistry,
    pub cmd_tx: mpsc::UnboundedSender<Command>,
    pub publish_policy: PublishPolicy,
}

impl Shared {
    /// Best-effort command send; after teardown the loop is gone and the
    /// command is irrelevant.
    pub fn send(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
    }
}

/// A realtime client: one connection, any number of channels multiplexed
/// over it.
///
/// All methods are non-blocking; connection work happens on a background
/// task and results arrive through state-change and message listeners.
/// Dropping the client closes the connection.
pub struct Realtime {
    shared: Arc<Shared>,
}

impl Realtime {
    /// Create a client. Must be called within a Tokio runtime (the
    /// connection event loop is spawned immediately, idle until
    /// [`connect`](Self::connect)).
    pub fn new(config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            conn: ConnShared::new(),
            registry: ChannelRegistry::new(),
            cmd_tx,
            publish_policy: config.publish_policy,
        });
        tokio::spawn(run_event_loop(
            EventLoopState {
                shared: shared.clone(),
                transport: config.transport,
                get_token: config.get_token,
                client_id: config.client_id,
                timing: config.timing,
            },
            cmd_rx,
        ));
        Self { shared }
    }

    /// Begin connecting. Idempotent: while already connecting or
    /// connected this is a no-op; from disconnected or suspended it cuts
    /// the current backoff short and retries immediately.
    pub fn connect(&self) {
        self.shared.send(Command::Connect);
    }

    /// Close the connection. Idempotent, succeeds from any state, and
    /// cancels in-flight token requests and pending reconnect attempts.
    pub fn close(&self) {
        self.shared.send(Command::Close);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.conn.state()
    }

    /// Register a listener invoked on every connection state transition
    /// with the new state, in transition order.
    pub fn on_state_change(
        &self,
        f: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.shared.conn.on_state_change(f)
    }

    /// Remove exactly the registration identified by `handle`.
    pub fn off_state_change(&self, handle: ListenerHandle) -> bool {
        self.shared.conn.off_state_change(handle)
    }

    /// Get (or lazily create) the channel named `name`. Repeated calls
    /// with the same name return handles to the same channel.
    pub fn channel(&self, name: &str) -> Channel {
        Channel {
            inner: self.shared.registry.get_or_create(name),
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Realtime {
    fn drop(&mut self) {
        self.shared.send(Command::Close);
    }
}
