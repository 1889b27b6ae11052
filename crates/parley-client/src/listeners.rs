//! Ordered listener registry keyed by event type.
//!
//! Callbacks for one event type fire in registration order. Duplicates are
//! allowed. Dispatch snapshots the list under the lock and invokes outside
//! it, so a callback may register or remove listeners (including itself)
//! without deadlocking. Each invocation is isolated: a panicking callback is
//! logged and the remaining callbacks still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

/// Shared callback type.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned by every registration. Unique for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct Entry<T> {
    id: ListenerId,
    callback: Callback<T>,
}

/// Event type → ordered callbacks.
pub struct ListenerRegistry<T> {
    entries: Mutex<HashMap<String, Vec<Entry<T>>>>,
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> ListenerRegistry<T> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `callback` to the list for `event_type`.
    pub fn add(&self, event_type: &str, callback: Callback<T>) -> ListenerId {
        let id = ListenerId::next();
        self.entries
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .push(Entry { id, callback });
        id
    }

    /// Remove the first registration of `callback` for `event_type`.
    pub fn remove(&self, event_type: &str, callback: &Callback<T>) -> bool {
        let mut entries = self.entries.lock();
        let Some(list) = entries.get_mut(event_type) else {
            return false;
        };
        let Some(pos) = list.iter().position(|e| Arc::ptr_eq(&e.callback, callback)) else {
            return false;
        };
        let _ = list.remove(pos);
        if list.is_empty() {
            let _ = entries.remove(event_type);
        }
        true
    }

    /// Remove the registration with `id`, whatever its event type.
    pub fn remove_id(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let mut emptied = None;
        let mut found = false;
        for (event_type, list) in entries.iter_mut() {
            if let Some(pos) = list.iter().position(|e| e.id == id) {
                let _ = list.remove(pos);
                found = true;
                if list.is_empty() {
                    emptied = Some(event_type.clone());
                }
                break;
            }
        }
        if let Some(event_type) = emptied {
            let _ = entries.remove(&event_type);
        }
        found
    }

    /// Invoke every callback registered for `event_type` with `value`.
    /// Returns how many callbacks ran.
    pub fn dispatch(&self, event_type: &str, value: &T) -> usize {
        let snapshot: Vec<Callback<T>> = match self.entries.lock().get(event_type) {
            Some(list) => list.iter().map(|e| Arc::clone(&e.callback)).collect(),
            None => return 0,
        };
        for callback in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                warn!(event_type, "listener panicked; continuing with the rest");
            }
        }
        snapshot.len()
    }

    /// Number of callbacks registered for `event_type`.
    pub fn count(&self, event_type: &str) -> usize {
        self.entries.lock().get(event_type).map_or(0, Vec::len)
    }

    /// Total number of registrations.
    pub fn total(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Callback<u32> {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        Arc::new(move |v: &u32| log.lock().push(format!("{tag}:{v}")))
    }

    #[test]
    fn dispatch_in_registration_order() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _ = registry.add("tick", recorder(&log, "a"));
        let _ = registry.add("tick", recorder(&log, "b"));
        let _ = registry.add("tick", recorder(&log, "c"));
        let _ = registry.add("other", recorder(&log, "x"));

        assert_eq!(registry.dispatch("tick", &7), 3);
        assert_eq!(*log.lock(), ["a:7", "b:7", "c:7"]);
    }

    #[test]
    fn dispatch_without_listeners_is_noop() {
        let registry: ListenerRegistry<u32> = ListenerRegistry::new();
        assert_eq!(registry.dispatch("nothing", &1), 0);
    }

    #[test]
    fn duplicates_fire_twice_and_remove_takes_first() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let cb = recorder(&log, "dup");
        let _ = registry.add("tick", Arc::clone(&cb));
        let _ = registry.add("tick", Arc::clone(&cb));

        let _ = registry.dispatch("tick", &1);
        assert_eq!(log.lock().len(), 2);

        assert!(registry.remove("tick", &cb));
        assert_eq!(registry.count("tick"), 1);
        assert!(registry.remove("tick", &cb));
        assert!(!registry.remove("tick", &cb));
        assert_eq!(registry.total(), 0);
    }

    #[test]
    fn remove_by_id() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = registry.add("tick", recorder(&log, "a"));
        let _b = registry.add("tick", recorder(&log, "b"));

        assert!(registry.remove_id(a));
        assert!(!registry.remove_id(a));
        let _ = registry.dispatch("tick", &2);
        assert_eq!(*log.lock(), ["b:2"]);
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _ = registry.add("tick", Arc::new(|_: &u32| panic!("listener bug")));
        let _ = registry.add("tick", recorder(&log, "after"));

        assert_eq!(registry.dispatch("tick", &3), 2);
        assert_eq!(*log.lock(), ["after:3"]);
    }

    #[test]
    fn listener_may_remove_itself_during_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let id = {
            let inner = Arc::clone(&registry);
            let hits = Arc::clone(&hits);
            let slot = Arc::clone(&slot);
            registry.add(
                "tick",
                Arc::new(move |_: &u32| {
                    let _ = hits.fetch_add(1, Ordering::SeqCst);
                    if let Some(id) = *slot.lock() {
                        let _ = inner.remove_id(id);
                    }
                }),
            )
        };
        *slot.lock() = Some(id);

        let _ = registry.dispatch("tick", &1);
        let _ = registry.dispatch("tick", &2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count("tick"), 0);
    }

    #[test]
    fn ids_are_unique() {
        let registry: ListenerRegistry<u32> = ListenerRegistry::new();
        let a = registry.add("x", Arc::new(|_: &u32| {}));
        let b = registry.add("x", Arc::new(|_: &u32| {}));
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("listener-"));
    }
}
