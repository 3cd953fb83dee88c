//! Named channels multiplexed over one connection.
//!
//! The registry is lookup-or-create: a name maps to at most one live
//! channel, and concurrent `get`s for a new name still produce a single
//! instance. Each channel carries its own attach state, listener sets,
//! pending-publish queue, and delivery queue; one channel failing never
//! touches another.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;

use crate::client::Shared;
use crate::connection::Command;
use crate::dispatcher::{DispatchQueue, ListenerSet};
use crate::state::{ChannelState, ConnectionState};
use crate::types::{Error, ListenerHandle, Message, PublishPolicy};

/// A publish waiting for the connection.
pub(crate) struct Outbound {
    pub name: String,
    pub data: Bytes,
}

pub(crate) struct ChannelInner {
    name: String,
    state: Mutex<ChannelState>,
    queue: DispatchQueue,
    msg_listeners: ListenerSet<Message>,
    state_listeners: ListenerSet<ChannelState>,
    pending: Mutex<VecDeque<Outbound>>,
}

impl ChannelInner {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(ChannelState::Initialized),
            queue: DispatchQueue::new(format!("channel:{name}")),
            msg_listeners: ListenerSet::new(),
            state_listeners: ListenerSet::new(),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a transition if the edge is valid. The notification is
    /// enqueued under the state lock, so listeners observe transitions in
    /// the order they occurred.
    pub fn transition(&self, to: ChannelState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_transition(to) {
            return false;
        }
        tracing::debug!(channel = %self.name, from = %*state, to = %to, "channel state change");
        *state = to;
        self.state_listeners.notify(&self.queue, to);
        true
    }

    /// Hand a message to this channel's subscribers, in arrival order.
    pub fn deliver(&self, msg: Message) {
        self.msg_listeners.notify(&self.queue, msg);
    }

    fn pending_lock(&self) -> MutexGuard<'_, VecDeque<Outbound>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_pending(&self, out: Outbound) {
        self.pending_lock().push_back(out);
    }

    pub fn pop_pending(&self) -> Option<Outbound> {
        self.pending_lock().pop_front()
    }

    pub fn requeue_front(&self, out: Outbound) {
        self.pending_lock().push_front(out);
    }

    /// Drop all queued publishes, returning how many were discarded.
    pub fn clear_pending(&self) -> usize {
        let mut pending = self.pending_lock();
        let dropped = pending.len();
        pending.clear();
        dropped
    }
}

/// Registry of all channels for one client.
pub(crate) struct ChannelRegistry {
    channels: DashMap<String, Arc<ChannelInner>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Lookup-or-create. The map entry is taken atomically, so two racing
    /// calls for a new name yield the same instance.
    pub fn get_or_create(&self, name: &str) -> Arc<ChannelInner> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelInner::new(name))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ChannelInner>> {
        self.channels.get(name).map(|entry| entry.clone())
    }

    pub fn snapshot(&self) -> Vec<Arc<ChannelInner>> {
        self.channels.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Handle to a named channel.
///
/// Clones (and repeated [`Realtime::channel`](crate::Realtime::channel)
/// calls with the same name) refer to the same underlying channel; two
/// handles compare equal exactly when they do.
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
    pub(crate) shared: Arc<Shared>,
}

impl Channel {
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Register a listener for messages on this channel and return its
    /// handle. Triggers attach if the channel is not already attaching or
    /// attached.
    pub fn subscribe(&self, f: impl Fn(Message) + Send + Sync + 'static) -> ListenerHandle {
        let handle = self.inner.msg_listeners.add(f);
        self.ensure_attach();
        handle
    }

    /// Remove exactly the registration identified by `handle`.
    pub fn unsubscribe(&self, handle: ListenerHandle) -> bool {
        self.inner.msg_listeners.remove(handle)
    }

    /// Drop all message listeners. The channel stays attached; use
    /// [`detach`](Self::detach) to release the attachment.
    pub fn unsubscribe_all(&self) {
        self.inner.msg_listeners.clear();
    }

    /// Register a listener for this channel's attach-state transitions,
    /// independent of message listeners.
    pub fn on_state_change(&self, f: impl Fn(ChannelState) + Send + Sync + 'static) -> ListenerHandle {
        self.inner.state_listeners.add(f)
    }

    pub fn off_state_change(&self, handle: ListenerHandle) -> bool {
        self.inner.state_listeners.remove(handle)
    }

    /// Explicitly release the channel's attachment. Message listeners are
    /// kept; a later [`subscribe`](Self::subscribe) re-attaches.
    pub fn detach(&self) {
        let state = self.inner.state();
        if matches!(state, ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended)
            && self.inner.transition(ChannelState::Detaching)
        {
            self.shared.send(Command::Detach(self.inner.name().to_string()));
        }
    }

    /// Publish an event on this channel.
    ///
    /// Requires a connected connection: while disconnected the message is
    /// queued or refused per the configured [`PublishPolicy`]. Never
    /// blocks on network I/O.
    pub fn publish(&self, event: &str, data: impl Into<Bytes>) -> Result<(), Error> {
        if self.inner.state() == ChannelState::Failed {
            return Err(Error::CallerMisuse(format!(
                "publish on failed channel \"{}\"",
                self.inner.name()
            )));
        }
        let conn_state = self.shared.conn.state();
        if conn_state.is_terminal() {
            return Err(Error::NotConnected);
        }
        if conn_state != ConnectionState::Connected
            && self.shared.publish_policy == PublishPolicy::FailFast
        {
            return Err(Error::NotConnected);
        }
        self.inner.push_pending(Outbound { name: event.to_string(), data: data.into() });
        self.shared.send(Command::Flush(self.inner.name().to_string()));
        Ok(())
    }

    fn ensure_attach(&self) {
        let state = self.inner.state();
        if matches!(state, ChannelState::Initialized | ChannelState::Detached)
            && self.inner.transition(ChannelState::Attaching)
        {
            self.shared.send(Command::Attach(self.inner.name().to_string()));
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name())
            .field("state", &self.inner.state())
            .finish()
    }
}
