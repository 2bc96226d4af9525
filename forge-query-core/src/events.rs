//! Cache events and listener fan-out.
//!
//! Observers (an inspector, a log sink) subscribe read-only. A listener that panics
//! is isolated: the panic is caught and logged, and the remaining listeners still
//! run.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::keys::QueryKey;

/// What happened to a cache entry or query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheEventKind {
    Get,
    Set,
    Delete,
    Clear,
    Gc,
    Fetch,
    Success,
    Error,
    Invalidate,
}

/// One introspection event.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent<T> {
    pub kind: CacheEventKind,
    /// `None` only for [`CacheEventKind::Clear`].
    pub key: Option<QueryKey>,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: u64,
}

impl<T> CacheEvent<T> {
    pub fn new(kind: CacheEventKind, key: Option<QueryKey>, timestamp: u64) -> Self {
        Self {
            kind,
            key,
            data: None,
            error: None,
            timestamp,
        }
    }

    pub fn with_data(mut self, data: Option<T>) -> Self {
        self.data = data;
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Callback receiving events of type `E`.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by every `subscribe`; call [`Unsubscribe::unsubscribe`] to detach.
///
/// Dropping the handle does not detach the listener.
#[must_use = "dropping the handle keeps the listener subscribed forever"]
pub struct Unsubscribe {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub fn new<F>(detach: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// Ordered set of listeners with panic isolation.
pub struct ListenerSet<E> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, Listener<E>)>>,
}

impl<E> ListenerSet<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Adds a listener and returns its id.
    pub fn add(&self, listener: Listener<E>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    /// Removes a listener; returns `true` if it was present.
    pub fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Delivers `event` to every listener.
    ///
    /// The listener list is copied first, so listeners may subscribe or
    /// unsubscribe from inside a callback.
    pub fn notify(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("listener panicked; ignoring");
            }
        }
    }
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for ListenerSet<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let seen = Arc::new(AtomicUsize::new(0));

        set.add(Arc::new(|_| panic!("faulty observer")));
        let counter = Arc::clone(&seen);
        set.add(Arc::new(move |value| {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
        }));

        set.notify(&3);
        set.notify(&4);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_remove_listener() {
        let set: ListenerSet<()> = ListenerSet::new();
        let id = set.add(Arc::new(|_| {}));
        assert_eq!(set.len(), 1);
        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(set.is_empty());
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let set: Arc<ListenerSet<()>> = Arc::new(ListenerSet::new());
        let slot = Arc::new(AtomicU64::new(0));

        let inner_set = Arc::clone(&set);
        let inner_slot = Arc::clone(&slot);
        let id = set.add(Arc::new(move |_| {
            inner_set.remove(inner_slot.load(Ordering::SeqCst));
        }));
        slot.store(id, Ordering::SeqCst);

        set.notify(&());
        assert!(set.is_empty());
    }

    #[test]
    fn test_unsubscribe_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = Unsubscribe::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
