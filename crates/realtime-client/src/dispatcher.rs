//! Listener bookkeeping and non-blocking, ordered event delivery.
//!
//! Every event source (the connection, each channel) owns one
//! [`DispatchQueue`]: a FIFO drained by a dedicated task, so listener code
//! never runs on the transport read path and cannot stall it. Ordering is
//! guaranteed within a queue, not across queues. A panicking listener is
//! caught and logged; delivery to the remaining listeners and to later
//! events continues.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::types::{ListenerHandle, next_handle};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// FIFO job queue drained by a background task.
pub(crate) struct DispatchQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl DispatchQueue {
    /// Spawns the drain task. Must be called within a Tokio runtime.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::warn!(queue = %label, "dispatch job panicked");
                }
            }
            tracing::trace!(queue = %label, "dispatch queue closed");
        });
        Self { tx }
    }

    /// Enqueue a job and return immediately.
    pub fn dispatch(&self, job: Job) {
        let _ = self.tx.send(job);
    }
}

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A set of listeners addressable by [`ListenerHandle`].
pub(crate) struct ListenerSet<T> {
    entries: Mutex<Vec<(ListenerHandle, Callback<T>)>>,
}

impl<T: Clone + Send + 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerHandle, Callback<T>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, f: impl Fn(T) + Send + Sync + 'static) -> ListenerHandle {
        let handle = next_handle();
        self.lock().push((handle, Arc::new(f)));
        handle
    }

    /// Remove exactly the registration identified by `handle`.
    pub fn remove(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(h, _)| *h != handle);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Snapshot the current listeners and enqueue one delivery job for
    /// `value`. Each listener call is individually panic-isolated.
    pub fn notify(&self, queue: &DispatchQueue, value: T) {
        let listeners: Vec<Callback<T>> = self.lock().iter().map(|(_, f)| f.clone()).collect();
        if listeners.is_empty() {
            return;
        }
        queue.dispatch(Box::new(move || {
            for listener in &listeners {
                let value = value.clone();
                if std::panic::catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                    tracing::warn!("listener panicked during delivery");
                }
            }
        }));
    }
}
