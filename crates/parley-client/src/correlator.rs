//! Inbound frame routing and one-shot reply correlation.
//!
//! A [`Correlator`] belongs to exactly one transport generation. The
//! supervisor creates a fresh one for every successful connect, so wiring
//! attached to a replaced transport is dropped with it and must be rebound.
//!
//! [`Correlator::expect`] registers a temporary listener that settles a
//! [`PendingReply`] on the first payload its predicate accepts. Register
//! before sending the request; the reply may arrive before the send returns.
//! The listener is removed when the reply settles, times out, or is dropped.

use std::sync::Arc;
use std::time::Duration;

use parley_core::envelope::InboundFrame;
use parley_core::{ParleyError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::listeners::{Callback, ListenerId, ListenerRegistry};

/// Event dispatcher for one transport generation.
pub struct Correlator {
    generation: u64,
    listeners: ListenerRegistry<Value>,
}

impl Correlator {
    /// Create a correlator for `generation`.
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            listeners: ListenerRegistry::new(),
        }
    }

    /// Transport generation this correlator serves.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Append a long-lived listener for `event_type`.
    pub fn add_listener(&self, event_type: &str, callback: Callback<Value>) -> ListenerId {
        debug!(event_type, generation = self.generation, "listener added");
        self.listeners.add(event_type, callback)
    }

    /// Remove the first registration of `callback`. No-op if absent.
    pub fn remove_listener(&self, event_type: &str, callback: &Callback<Value>) -> bool {
        self.listeners.remove(event_type, callback)
    }

    /// Remove a registration by id. No-op if absent.
    pub fn remove_listener_id(&self, id: ListenerId) -> bool {
        self.listeners.remove_id(id)
    }

    /// Listeners currently registered for `event_type`.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners.count(event_type)
    }

    /// Parse a raw text frame and dispatch it. Malformed frames are logged
    /// and dropped.
    pub fn dispatch_text(&self, text: &str) {
        match InboundFrame::parse(text) {
            Ok(frame) => self.dispatch_frame(&frame),
            Err(e) => warn!(error = %e, "dropping inbound frame"),
        }
    }

    /// Deliver `frame`'s payload to every listener of its event type, in
    /// registration order.
    pub fn dispatch_frame(&self, frame: &InboundFrame) {
        let delivered = self.listeners.dispatch(frame.event_type(), frame.payload());
        debug!(
            event_type = frame.event_type(),
            delivered,
            generation = self.generation,
            "frame dispatched"
        );
    }

    /// Register a one-shot listener for the first `event_type` payload
    /// accepted by `predicate`.
    pub fn expect<P>(self: &Arc<Self>, event_type: &str, predicate: P) -> PendingReply
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let id = self.listeners.add(
            event_type,
            Arc::new(move |payload: &Value| {
                if !predicate(payload) {
                    return;
                }
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(payload.clone());
                }
            }),
        );
        PendingReply {
            rx,
            guard: ListenerGuard {
                correlator: Arc::clone(self),
                id,
            },
        }
    }

    /// Wait for the first `event_type` payload accepted by `predicate`.
    pub async fn await_once<P>(
        self: &Arc<Self>,
        event_type: &str,
        predicate: P,
        timeout: Duration,
        operation: &str,
    ) -> Result<Value>
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.expect(event_type, predicate).wait(timeout, operation).await
    }
}

/// Removes a one-shot listener when dropped.
struct ListenerGuard {
    correlator: Arc<Correlator>,
    id: ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let _ = self.correlator.remove_listener_id(self.id);
    }
}

/// An outstanding correlated reply.
pub struct PendingReply {
    rx: oneshot::Receiver<Value>,
    guard: ListenerGuard,
}

impl PendingReply {
    /// Wait up to `timeout` for the reply. Settles exactly once; the
    /// listener is gone when this returns.
    pub async fn wait(self, timeout: Duration, operation: &str) -> Result<Value> {
        let Self { rx, guard } = self;
        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);
        match outcome {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ParleyError::transport(format!(
                "reply listener for {operation} was dropped"
            ))),
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                debug!(operation, timeout_ms, "correlated reply timed out");
                Err(ParleyError::timeout(operation, timeout_ms))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
