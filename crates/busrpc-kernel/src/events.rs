//! Local event hub.
//!
//! Listeners are keyed by event name and fire in registration order. The
//! lifecycle events [`CONNECT_EVENT`] and [`DISCONNECT_EVENT`] share the
//! namespace with user messages delivered by `send`.

use crate::node::RemoteNode;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Raised when a remote process becomes Known.
pub const CONNECT_EVENT: &str = "connect";

/// Raised when a Known remote process announces its departure.
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Event listener. Lifecycle events pass `Value::Null` as data.
pub type Listener = Arc<dyn Fn(&RemoteNode, &Value) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    by_event: HashMap<String, Vec<(u64, Listener)>>,
    next_id: u64,
}

/// Per-instance listener table. Cloning shares the table.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<Mutex<Listeners>>,
}

impl EventHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> Disposer
    where
        F: Fn(&RemoteNode, &Value) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .by_event
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        Disposer {
            hub: Arc::downgrade(&self.inner),
            event: event.to_string(),
            id,
        }
    }

    /// Notify every listener of `event`. Returns how many were called.
    ///
    /// Listeners run outside the table lock, so they may register or
    /// dispose listeners themselves.
    pub fn emit(&self, event: &str, node: &RemoteNode, data: &Value) -> usize {
        let listeners: Vec<Listener> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.by_event.get(event) {
                Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return 0,
            }
        };
        for listener in &listeners {
            listener(node, data);
        }
        listeners.len()
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_event.get(event).map(Vec::len).unwrap_or(0)
    }

    /// Drop every listener.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_event.clear();
    }
}

/// Removes the one listener it was returned for.
///
/// Dropping a `Disposer` without calling [`dispose`](Self::dispose) leaves
/// the listener registered.
pub struct Disposer {
    hub: Weak<Mutex<Listeners>>,
    event: String,
    id: u64,
}

impl Disposer {
    /// Unregister the listener. A no-op if it is already gone.
    pub fn dispose(self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let mut inner = hub.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = inner.by_event.get_mut(&self.event) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                inner.by_event.remove(&self.event);
            }
        }
    }
}
