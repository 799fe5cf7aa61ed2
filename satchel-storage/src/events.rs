//! Change notifications for local and remote mutations.
//!
//! Every cache mutation produces one [`ChangeEvent`], dispatched
//! synchronously to each registered callback on the task that caused it.
//! There is no batching: two quick writes to one key are two dispatches.
//! Async consumers can take a broadcast receiver instead with
//! [`ChangeBus::stream`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use satchel_core::ChangeEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Callback invoked for every change event.
pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

const STREAM_CAPACITY: usize = 256;

struct Registry {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, ChangeHandler)>>,
    stream: broadcast::Sender<ChangeEvent>,
}

impl Registry {
    fn remove(&self, id: u64) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }
}

/// Dispatcher for [`ChangeEvent`]s. Cloning shares the listener list.
#[derive(Clone)]
pub struct ChangeBus {
    registry: Arc<Registry>,
}

impl std::fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        let (stream, _rx) = broadcast::channel(STREAM_CAPACITY);
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                handlers: Mutex::new(Vec::new()),
                stream,
            }),
        }
    }

    /// Register a callback. It stays registered until the returned
    /// [`Listener`] is dropped or unsubscribed.
    pub fn listen<F>(&self, callback: F) -> Listener
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self
            .registry
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        handlers.push((id, Arc::new(callback)));
        Listener {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Receive every future event on an async channel.
    ///
    /// Slow receivers lag and lose the oldest events.
    pub fn stream(&self) -> broadcast::Receiver<ChangeEvent> {
        self.registry.stream.subscribe()
    }

    /// Dispatch an event to every listener, in registration order.
    ///
    /// Handlers run outside the registry lock, so a handler may register or
    /// drop listeners. Changes made during dispatch apply from the next event.
    pub fn emit(&self, event: &ChangeEvent) {
        let handlers: Vec<ChangeHandler> = {
            let handlers = self
                .registry
                .handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        trace!(key = %event.key, listeners = handlers.len(), "Dispatching change event");
        for handler in handlers {
            handler(event);
        }
        // No stream receivers is fine.
        let _ = self.registry.stream.send(event.clone());
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Registration handle returned by [`ChangeBus::listen`].
///
/// Dropping it unsubscribes.
#[must_use = "dropping a Listener unsubscribes it immediately"]
#[derive(Debug)]
pub struct Listener {
    id: u64,
    registry: Weak<Registry>,
}

impl Listener {
    /// Remove the callback now.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the callback registered for as long as the bus lives.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}
