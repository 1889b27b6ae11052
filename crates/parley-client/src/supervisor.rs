//! Connection supervision: open, handshake, pump, reconnect.
//!
//! [`ConnectionSupervisor::connect`] is a single attempt. It opens a
//! transport and suspends until the backend's `socket_connected`
//! acknowledgment (success), a transport error (failure), or the handshake
//! timeout (failure). A successful attempt installs a new generation: a
//! fresh [`Correlator`], the captured socket id, and a pump task that feeds
//! every later frame into that correlator.
//!
//! Retry policy lives outside `connect`:
//! - [`reconnect`](ConnectionSupervisor::reconnect) runs bounded attempts
//!   with a fixed delay. The attempt counter persists across calls and is
//!   reset only by a success.
//! - An abnormal close of the current generation schedules exactly one
//!   attempt after the unsolicited delay.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::constants::inbound::SOCKET_CONNECTED;
use parley_core::constants::{CLOSE_ABNORMAL, CLOSE_NORMAL};
use parley_core::envelope::InboundFrame;
use parley_core::{ParleyError, Result, SocketId};
use parley_settings::{ClientSettings, ReconnectSettings};
use parley_transport::{OpenedTransport, ReadyState, Transport, TransportEvent, TransportFactory};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::correlator::Correlator;

/// Invoked after a new generation is installed, before its first frame is
/// dispatched.
pub type ConnectedHook = Arc<dyn Fn(&Arc<Correlator>) + Send + Sync>;

/// Lifecycle of the supervised connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// Handshake complete; the transport is usable.
    Open,
    /// An intentional close is in progress.
    Closing,
    /// Closed, or the last attempt failed. `reconnect` may follow.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct Link {
    transport: Option<Arc<dyn Transport>>,
    correlator: Arc<Correlator>,
    socket_id: Option<SocketId>,
    generation: u64,
    state: ConnectionState,
    closing: bool,
}

/// Owns the single real-time connection for one credential and endpoint.
pub struct ConnectionSupervisor {
    url: Url,
    factory: Arc<dyn TransportFactory>,
    handshake_timeout: Duration,
    policy: ReconnectSettings,
    link: Mutex<Link>,
    attempts: AtomicU32,
    reconnect_lock: tokio::sync::Mutex<()>,
    generation_tx: watch::Sender<u64>,
    on_connected: Mutex<Option<ConnectedHook>>,
    scheduled: Mutex<Option<CancellationToken>>,
    me: Weak<Self>,
}

impl ConnectionSupervisor {
    /// Create a supervisor for `url`. Nothing is opened until `connect`.
    pub fn new(url: Url, factory: Arc<dyn TransportFactory>, settings: &ClientSettings) -> Arc<Self> {
        let (generation_tx, _) = watch::channel(0);
        Arc::new_cyclic(|me| Self {
            url,
            factory,
            handshake_timeout: settings.timeouts.handshake(),
            policy: settings.reconnect.clone(),
            link: Mutex::new(Link {
                transport: None,
                correlator: Arc::new(Correlator::new(0)),
                socket_id: None,
                generation: 0,
                state: ConnectionState::Idle,
                closing: false,
            }),
            attempts: AtomicU32::new(0),
            reconnect_lock: tokio::sync::Mutex::new(()),
            generation_tx,
            on_connected: Mutex::new(None),
            scheduled: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Install the hook run after every successful connect.
    pub fn set_on_connected(&self, hook: ConnectedHook) {
        *self.on_connected.lock() = Some(hook);
    }

    // ── Primitives ───────────────────────────────────────────────────────

    /// One connect attempt. Resolves with the backend socket id once the
    /// handshake arrives.
    pub async fn connect(&self) -> Result<SocketId> {
        self.link.lock().state = ConnectionState::Connecting;
        info!(url = %self.url, "connecting");

        let OpenedTransport { transport, mut events } = match self.factory.open(&self.url).await {
            Ok(opened) => opened,
            Err(e) => {
                self.settle_failed_attempt();
                warn!(error = %e, "transport open failed");
                return Err(e.into());
            }
        };

        let handshake = tokio::time::timeout(self.handshake_timeout, await_handshake(&mut events)).await;
        let socket_id = match handshake {
            Ok(Ok(socket_id)) => socket_id,
            Ok(Err(e)) => {
                self.settle_failed_attempt();
                let _ = transport.close(CLOSE_NORMAL, "handshake failed").await;
                warn!(error = %e, "handshake failed");
                return Err(e);
            }
            Err(_) => {
                self.settle_failed_attempt();
                let _ = transport.close(CLOSE_NORMAL, "handshake timeout").await;
                let timeout_ms = u64::try_from(self.handshake_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(timeout_ms, "handshake timed out");
                return Err(ParleyError::timeout("connection handshake", timeout_ms));
            }
        };

        let (correlator, previous, generation) = {
            let mut link = self.link.lock();
            link.generation += 1;
            let correlator = Arc::new(Correlator::new(link.generation));
            let previous = link.transport.replace(Arc::clone(&transport));
            link.correlator = Arc::clone(&correlator);
            link.socket_id = Some(socket_id.clone());
            link.state = ConnectionState::Open;
            link.closing = false;
            (correlator, previous, link.generation)
        };
        if let Some(previous) = previous {
            let _ = previous.close(CLOSE_NORMAL, "replaced").await;
        }

        let hook = self.on_connected.lock().clone();
        if let Some(hook) = hook {
            hook(&correlator);
        }
        drop(tokio::spawn(pump(self.me.clone(), generation, events, correlator)));
        let _ = self.generation_tx.send_replace(generation);

        info!(generation, socket_id = %socket_id, "connected");
        Ok(socket_id)
    }

    /// Whether a transport exists and is open.
    pub fn is_active(&self) -> bool {
        self.link
            .lock()
            .transport
            .as_ref()
            .is_some_and(|t| t.state() == ReadyState::Open)
    }

    /// Reconnect unless already active, retrying with a fixed delay until
    /// the attempt budget is spent.
    pub async fn reconnect(&self) -> Result<()> {
        let _serial = self.reconnect_lock.lock().await;
        loop {
            if self.is_active() {
                return Ok(());
            }
            let made = self.attempts.load(Ordering::SeqCst);
            if made >= self.policy.max_attempts {
                error!(attempts = made, "reconnect budget exhausted");
                return Err(ParleyError::ReconnectExhausted { attempts: made });
            }
            let attempt = made + 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            info!(attempt, max_attempts = self.policy.max_attempts, "reconnecting");

            match self.connect().await {
                Ok(_) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay()).await;
                    }
                }
            }
        }
    }

    /// Current transport handle. Do not cache it: reconnect replaces it.
    pub fn socket(&self) -> Option<Arc<dyn Transport>> {
        self.link.lock().transport.clone()
    }

    // ── Accessors ────────────────────────────────────────────────────────

    /// Backend connection id from the last handshake.
    pub fn socket_id(&self) -> Option<SocketId> {
        self.link.lock().socket_id.clone()
    }

    /// Correlator of the current generation.
    pub fn correlator(&self) -> Arc<Correlator> {
        Arc::clone(&self.link.lock().correlator)
    }

    /// Current generation; 0 before the first connect.
    pub fn generation(&self) -> u64 {
        self.link.lock().generation
    }

    /// Observe generation changes.
    pub fn watch_generation(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    /// Consecutive failed reconnect attempts.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    // ── Sending and closing ──────────────────────────────────────────────

    /// Hand one frame to the current transport.
    pub async fn send(&self, text: String) -> Result<()> {
        let transport = self
            .socket()
            .ok_or_else(|| ParleyError::transport("not connected"))?;
        transport.send(text).await.map_err(Into::into)
    }

    /// Close intentionally with the normal code. No reconnect is scheduled.
    pub async fn close(&self) -> Result<()> {
        if let Some(token) = self.scheduled.lock().take() {
            token.cancel();
        }
        let transport = {
            let mut link = self.link.lock();
            link.closing = true;
            match &link.transport {
                Some(t) if !matches!(t.state(), ReadyState::Closing | ReadyState::Closed) => {
                    let t = Arc::clone(t);
                    link.state = ConnectionState::Closing;
                    Some(t)
                }
                _ => {
                    link.state = ConnectionState::Closed;
                    None
                }
            }
        };
        if let Some(transport) = transport {
            info!("closing connection");
            transport.close(CLOSE_NORMAL, "client closed").await?;
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn settle_failed_attempt(&self) {
        let mut link = self.link.lock();
        let open = link
            .transport
            .as_ref()
            .is_some_and(|t| t.state() == ReadyState::Open);
        link.state = if open {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        };
    }

    fn handle_close(&self, generation: u64, code: u16, reason: &str) {
        let unsolicited = {
            let mut link = self.link.lock();
            if link.generation != generation {
                debug!(generation, current = link.generation, "stale transport closed");
                return;
            }
            link.state = ConnectionState::Closed;
            !link.closing && code != CLOSE_NORMAL
        };
        if unsolicited {
            warn!(code, reason, generation, "connection closed abnormally; scheduling reconnect");
            self.schedule_reconnect();
        } else {
            info!(code, generation, "connection closed");
        }
    }

    fn schedule_reconnect(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.scheduled.lock().replace(token.clone()) {
            previous.cancel();
        }
        let me = self.me.clone();
        let delay = self.policy.unsolicited_delay();
        drop(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            if let Some(supervisor) = me.upgrade() {
                supervisor.scheduled_attempt().await;
            }
        }));
    }

    async fn scheduled_attempt(&self) {
        let _serial = self.reconnect_lock.lock().await;
        if self.is_active() {
            return;
        }
        match self.connect().await {
            Ok(_) => self.attempts.store(0, Ordering::SeqCst),
            Err(e) => warn!(error = %e, "scheduled reconnect failed"),
        }
    }
}

async fn await_handshake(events: &mut mpsc::Receiver<TransportEvent>) -> Result<SocketId> {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Open => debug!("transport open; awaiting handshake"),
            TransportEvent::Message(text) => match InboundFrame::parse(&text) {
                Ok(frame) if frame.event_type() == SOCKET_CONNECTED => {
                    return frame
                        .socket_id()
                        .ok_or_else(|| ParleyError::protocol("socket_connected without socket_id"));
                }
                Ok(frame) => debug!(event_type = frame.event_type(), "frame before handshake ignored"),
                Err(e) => warn!(error = %e, "malformed frame before handshake"),
            },
            TransportEvent::Error(message) => return Err(ParleyError::transport(message)),
            TransportEvent::Close { code, reason } => {
                return Err(ParleyError::transport(format!(
                    "closed during handshake ({code}): {reason}"
                )));
            }
        }
    }
    Err(ParleyError::transport("event stream ended during handshake"))
}

async fn pump(
    supervisor: Weak<ConnectionSupervisor>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    correlator: Arc<Correlator>,
) {
    let (code, reason) = loop {
        match events.recv().await {
            Some(TransportEvent::Message(text)) => correlator.dispatch_text(&text),
            Some(TransportEvent::Open) => {}
            Some(TransportEvent::Error(message)) => warn!(generation, %message, "transport error"),
            Some(TransportEvent::Close { code, reason }) => break (code, reason),
            None => break (CLOSE_ABNORMAL, "event stream ended".to_string()),
        }
    };
    if let Some(supervisor) = supervisor.upgrade() {
        supervisor.handle_close(generation, code, &reason);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parley_transport::{MemoryPeer, MemoryTransportFactory};
    use serde_json::{Value, json};

    fn settings() -> ClientSettings {
        let mut settings = ClientSettings::custom("ws://memory/ws", "http://memory");
        settings.reconnect.max_attempts = 3;
        settings
    }

    fn supervisor(factory: &Arc<MemoryTransportFactory>) -> Arc<ConnectionSupervisor> {
        let url = Url::parse("ws://memory/ws").unwrap();
        ConnectionSupervisor::new(url, Arc::clone(factory) as Arc<dyn TransportFactory>, &settings())
    }

    async fn connected(
        sup: &ConnectionSupervisor,
        factory: &MemoryTransportFactory,
        socket_id: &str,
    ) -> MemoryPeer {
        let (result, peer) = tokio::join!(sup.connect(), async {
            let peer = factory.accept().await.unwrap();
            assert!(peer.handshake(socket_id).await);
            peer
        });
        assert_eq!(result.unwrap().as_str(), socket_id);
        peer
    }

    #[tokio::test]
    async fn connect_captures_socket_id_and_opens() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        assert_eq!(sup.state(), ConnectionState::Idle);
        assert!(!sup.is_active());

        let _peer = connected(&sup, &factory, "s1").await;
        assert!(sup.is_active());
        assert_eq!(sup.state(), ConnectionState::Open);
        assert_eq!(sup.socket_id().unwrap().as_str(), "s1");
        assert_eq!(sup.generation(), 1);
        assert_eq!(sup.correlator().generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_without_handshake_times_out() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        let (result, _peer) = tokio::join!(sup.connect(), factory.accept());

        let err = result.unwrap_err();
        assert_matches!(err, ParleyError::Timeout { timeout_ms: 10_000, .. });
        assert!(!sup.is_active());
        assert_eq!(sup.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn transport_error_rejects_immediately() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        let (result, ()) = tokio::join!(sup.connect(), async {
            factory.accept().await.unwrap().fail("refused upstream").await;
        });
        assert_matches!(result, Err(ParleyError::Transport { ref message }) if message == "refused upstream");
    }

    #[tokio::test]
    async fn frames_after_handshake_reach_the_new_correlator() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        let (tx, mut rx) = mpsc::unbounded_channel();
        sup.set_on_connected(Arc::new(move |correlator: &Arc<Correlator>| {
            let tx = tx.clone();
            let _ = correlator.add_listener(
                "bot_message",
                Arc::new(move |p: &Value| {
                    let _ = tx.send(p.clone());
                }),
            );
        }));

        let peer = connected(&sup, &factory, "s1").await;
        assert!(peer.send_event("bot_message", json!({"content": "hi"})).await);
        assert_eq!(rx.recv().await.unwrap()["content"], "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_schedules_exactly_one_attempt() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        let peer = connected(&sup, &factory, "s1").await;

        factory.fail_next(10);
        peer.close(CLOSE_ABNORMAL, "network").await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(factory.open_count(), 2);
        assert_eq!(sup.state(), ConnectionState::Closed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(factory.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_reconnects_after_delay() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        let peer = connected(&sup, &factory, "s1").await;
        let mut generations = sup.watch_generation();
        let _ = generations.borrow_and_update();

        peer.close(CLOSE_ABNORMAL, "network").await;
        let second = factory.accept().await.unwrap();
        assert!(second.handshake("s2").await);
        generations.changed().await.unwrap();

        assert_eq!(*generations.borrow(), 2);
        assert!(sup.is_active());
        assert_eq!(sup.socket_id().unwrap().as_str(), "s2");
    }

    #[tokio::test(start_paused = true)]
    async fn normal_close_from_peer_does_not_reconnect() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        let peer = connected(&sup, &factory, "s1").await;

        peer.close(CLOSE_NORMAL, "bye").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(factory.open_count(), 1);
        assert_eq!(sup.state(), ConnectionState::Closed);
        assert!(!sup.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn intentional_close_does_not_reconnect() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        let _peer = connected(&sup, &factory, "s1").await;

        sup.close().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(factory.open_count(), 1);
        assert_eq!(sup.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_exhausts_budget_then_stops() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        factory.fail_next(100);

        let err = sup.reconnect().await.unwrap_err();
        assert_matches!(err, ParleyError::ReconnectExhausted { attempts: 3 });
        assert_eq!(factory.open_count(), 3);

        let err = sup.reconnect().await.unwrap_err();
        assert_matches!(err, ParleyError::ReconnectExhausted { attempts: 3 });
        assert_eq!(factory.open_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnect_waits_only_between_attempts() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        factory.fail_next(100);

        let delay = settings().reconnect.delay();
        let started = tokio::time::Instant::now();
        let err = sup.reconnect().await.unwrap_err();
        let elapsed = started.elapsed();
        assert_matches!(err, ParleyError::ReconnectExhausted { attempts: 3 });
        assert!(elapsed >= delay * 2 && elapsed < delay * 3, "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_success_resets_counter() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        factory.fail_next(2);

        let (result, _peer) = tokio::join!(sup.reconnect(), async {
            let peer = factory.accept().await.unwrap();
            assert!(peer.handshake("s9").await);
            peer
        });
        result.unwrap();
        assert_eq!(factory.open_count(), 3);
        assert_eq!(sup.attempts(), 0);
        assert!(sup.is_active());
    }

    #[tokio::test]
    async fn reconnect_when_active_is_noop() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        let _peer = connected(&sup, &factory, "s1").await;
        sup.reconnect().await.unwrap();
        assert_eq!(factory.open_count(), 1);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let sup = supervisor(&factory);
        let err = sup.send("x".into()).await.unwrap_err();
        assert_matches!(err, ParleyError::Transport { .. });

        let mut peer = connected(&sup, &factory, "s1").await;
        sup.send("hello".into()).await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), "hello");
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
