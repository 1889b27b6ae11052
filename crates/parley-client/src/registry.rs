//! At-most-one session object per conversation id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_core::ConversationId;

/// Conversation id → live session.
///
/// Lookup-or-construct runs under one lock, so concurrent callers asking
/// for the same id always receive the same `Arc`.
pub struct SessionRegistry<S> {
    sessions: Mutex<HashMap<ConversationId, Arc<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> SessionRegistry<S> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session for `id`, or the one `factory` builds. `factory`
    /// runs at most once per id until [`remove`](Self::remove). It must not
    /// call back into this registry.
    pub fn get_or_create<F>(&self, id: &ConversationId, factory: F) -> Arc<S>
    where
        F: FnOnce() -> Arc<S>,
    {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(id) {
            return Arc::clone(existing);
        }
        let created = factory();
        let _ = sessions.insert(id.clone(), Arc::clone(&created));
        created
    }

    /// Session for `id`, if registered.
    pub fn get(&self, id: &ConversationId) -> Option<Arc<S>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Forget `id`. The session object itself is not notified.
    pub fn remove(&self, id: &ConversationId) -> Option<Arc<S>> {
        self.sessions.lock().remove(id)
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<S>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Registered ids.
    pub fn ids(&self) -> Vec<ConversationId> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
