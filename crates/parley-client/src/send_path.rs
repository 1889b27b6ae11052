//! Outbound delivery.
//!
//! - **Fire-and-forget**: the frame is handed to the transport and the call
//!   resolves. A send failure rejects the call.
//! - **Confirmed**: resolves only on the backend's reply. With
//!   [`DeliveryStrategy::Realtime`] the reply is correlated on the real-time
//!   channel by event type plus the request's own identifiers, under a fixed
//!   timeout. With [`DeliveryStrategy::Rest`] the envelope, tagged with the
//!   socket id, is POSTed and the response body is the reply.
//!
//! One client uses one strategy for every confirmed operation.
//!
//! A real-time reply that carries no request-specific key can't be told
//! apart from a concurrent one of the same type, so such exchanges run one
//! at a time per reply type.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parley_core::envelope::Envelope;
use parley_core::{ConversationId, MessageId, ParleyError, Result};
use parley_settings::DeliveryStrategy;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::http::HttpSideChannel;
use crate::supervisor::ConnectionSupervisor;

/// What a confirmed operation waits for.
#[derive(Clone, Debug)]
pub struct Confirmation {
    reply_type: &'static str,
    operation: &'static str,
    timeout: Duration,
    correlate: Vec<(&'static str, String)>,
    echoed: Vec<(&'static str, String)>,
}

impl Confirmation {
    /// Wait for `reply_type`; `operation` names the call in errors.
    pub fn new(reply_type: &'static str, operation: &'static str, timeout: Duration) -> Self {
        Self {
            reply_type,
            operation,
            timeout,
            correlate: Vec::new(),
            echoed: Vec::new(),
        }
    }

    /// Require the reply's `conversation_id` to equal `id`.
    #[must_use]
    pub fn conversation(self, id: &ConversationId) -> Self {
        self.field("conversation_id", id.as_str())
    }

    /// Require the reply's `message_id` to equal `id`.
    #[must_use]
    pub fn message(self, id: &MessageId) -> Self {
        self.field("message_id", id.as_str())
    }

    /// Require the reply's `key` field to equal `value`.
    #[must_use]
    pub fn field(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.correlate.push((key, value.into()));
        self
    }

    /// Reject replies whose `key` field is present and differs from
    /// `value`. Replies without the field still match.
    #[must_use]
    pub fn echoed(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.echoed.push((key, value.into()));
        self
    }

    /// Whether replies are told apart by at least one required key.
    pub fn is_correlated(&self) -> bool {
        !self.correlate.is_empty()
    }

    /// Operation name used in errors.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Whether `payload` is the reply this confirmation waits for.
    pub fn matches(&self, payload: &Value) -> bool {
        let required = self
            .correlate
            .iter()
            .all(|(key, want)| payload.get(*key).and_then(Value::as_str) == Some(want.as_str()));
        required
            && self
                .echoed
                .iter()
                .all(|(key, want)| payload.get(*key).is_none_or(|got| got.as_str() == Some(want.as_str())))
    }
}

/// Delivery for one client.
pub struct SendPath {
    supervisor: Arc<ConnectionSupervisor>,
    http: HttpSideChannel,
    strategy: DeliveryStrategy,
    uncorrelated: DashMap<&'static str, Arc<AsyncMutex<()>>>,
}

impl SendPath {
    /// Bind delivery to a supervisor and side channel.
    pub fn new(supervisor: Arc<ConnectionSupervisor>, http: HttpSideChannel, strategy: DeliveryStrategy) -> Self {
        Self {
            supervisor,
            http,
            strategy,
            uncorrelated: DashMap::new(),
        }
    }

    /// Strategy used for confirmed operations.
    pub fn strategy(&self) -> DeliveryStrategy {
        self.strategy
    }

    /// Send without waiting for a reply.
    pub async fn fire(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope.to_json()?;
        debug!(event_type = envelope.event_type(), "sending frame");
        self.supervisor.send(text).await
    }

    /// Send and wait for the confirmation. Returns the reply payload.
    pub async fn confirm(&self, envelope: Envelope, confirmation: Confirmation) -> Result<Value> {
        match self.strategy {
            DeliveryStrategy::Realtime => {
                let lane = (!confirmation.is_correlated()).then(|| {
                    Arc::clone(self.uncorrelated.entry(confirmation.reply_type).or_default().value())
                });
                let _turn = match &lane {
                    Some(lane) => Some(lane.lock().await),
                    None => None,
                };
                let correlator = self.supervisor.correlator();
                let matcher = confirmation.clone();
                let pending = correlator.expect(confirmation.reply_type, move |p: &Value| matcher.matches(p));
                self.fire(&envelope).await?;
                pending.wait(confirmation.timeout, confirmation.operation).await
            }
            DeliveryStrategy::Rest => {
                let socket_id = self.supervisor.socket_id().ok_or_else(|| {
                    ParleyError::transport(format!(
                        "no socket id for {}: connect first",
                        confirmation.operation
                    ))
                })?;
                let frame = self
                    .http
                    .post_envelope(&envelope.with_socket_id(socket_id), confirmation.operation)
                    .await?;
                if frame.event_type() != confirmation.reply_type {
                    debug!(
                        expected = confirmation.reply_type,
                        received = frame.event_type(),
                        "REST reply type differs"
                    );
                }
                Ok(frame.event.event_payload)
            }
        }
    }

    /// Run `fut` behind the reconnect guard.
    pub async fn guarded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        with_reconnect_guard(&self.supervisor, operation, fut).await
    }
}

/// If the connection is down, reconnect before running `fut`. A failed
/// reconnect fails the call with [`ParleyError::ReconnectGuard`] and `fut`
/// never runs.
pub async fn with_reconnect_guard<T, F>(
    supervisor: &ConnectionSupervisor,
    operation: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if !supervisor.is_active() {
        debug!(operation, "connection inactive; reconnecting first");
        supervisor
            .reconnect()
            .await
            .map_err(|e| ParleyError::ReconnectGuard {
                operation: operation.to_string(),
                source: Box::new(e),
            })?;
    }
    fut.await
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parley_core::ApiKey;
    use parley_core::envelope::PayloadBuilder;
    use parley_settings::ClientSettings;
    use parley_transport::{MemoryPeer, MemoryTransportFactory, TransportFactory};
    use serde_json::json;
    use tokio::time::timeout;
    use url::Url;

    fn build(
        strategy: DeliveryStrategy,
        http_base: &str,
    ) -> (SendPath, Arc<ConnectionSupervisor>, Arc<MemoryTransportFactory>) {
        let factory = Arc::new(MemoryTransportFactory::new());
        let mut settings = ClientSettings::custom("ws://memory/ws", http_base);
        settings.reconnect.max_attempts = 2;
        let sup = ConnectionSupervisor::new(
            Url::parse("ws://memory/ws").unwrap(),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            &settings,
        );
        let http = HttpSideChannel::new(
            reqwest::Client::new(),
            Url::parse(http_base).unwrap(),
            ApiKey::new("k"),
            Duration::from_secs(5),
        );
        (SendPath::new(Arc::clone(&sup), http, strategy), sup, factory)
    }

    async fn connect(sup: &ConnectionSupervisor, factory: &MemoryTransportFactory) -> MemoryPeer {
        let (result, peer) = tokio::join!(sup.connect(), async {
            let peer = factory.accept().await.unwrap();
            assert!(peer.handshake("s1").await);
            peer
        });
        let _ = result.unwrap();
        peer
    }

    fn metadata_envelope() -> Envelope {
        PayloadBuilder::new()
            .conversation(&ConversationId::from("c1"))
            .field("metadata", json!({"a": 1}))
            .into_envelope("update_metadata")
    }

    #[test]
    fn confirmation_matches_all_keys() {
        let c = Confirmation::new("message_edited_success", "message edit", Duration::from_secs(1))
            .conversation(&ConversationId::from("c1"))
            .message(&MessageId::from("m1"));
        assert!(c.matches(&json!({"conversation_id": "c1", "message_id": "m1", "x": 1})));
        assert!(!c.matches(&json!({"conversation_id": "c1", "message_id": "m2"})));
        assert!(!c.matches(&json!({"conversation_id": "c1"})));
        assert!(!c.matches(&json!({"conversation_id": "c2", "message_id": "m1"})));
        assert!(c.is_correlated());
        assert_eq!(c.operation(), "message edit");
    }

    #[test]
    fn echoed_key_rejects_only_a_different_value() {
        let c = Confirmation::new("conversation_start_success", "conversation start", Duration::from_secs(1))
            .echoed("user_id", "u1");
        assert!(c.matches(&json!({"conversation_id": "c1", "user_id": "u1"})));
        assert!(c.matches(&json!({"conversation_id": "c1"})));
        assert!(c.matches(&json!([])));
        assert!(!c.matches(&json!({"conversation_id": "c2", "user_id": "u2"})));
        assert!(!c.is_correlated());
    }

    #[test]
    fn confirmation_without_keys_matches_anything() {
        let c = Confirmation::new("conversation_start_success", "conversation start", Duration::from_secs(1));
        assert!(c.matches(&json!({"conversation_id": "whatever"})));
    }

    #[tokio::test]
    async fn realtime_confirm_resolves_on_correlated_reply() {
        let (path, sup, factory) = build(DeliveryStrategy::Realtime, "http://unused");
        let mut peer = connect(&sup, &factory).await;

        let confirmation = Confirmation::new("metadata_update_success", "metadata update", Duration::from_secs(15))
            .conversation(&ConversationId::from("c1"));
        let (result, ()) = tokio::join!(path.confirm(metadata_envelope(), confirmation), async {
            let request = peer.recv_json().await.unwrap();
            assert_eq!(request["event"]["event_type"], "update_metadata");
            assert!(request["event"].get("socket_id").is_none());
            assert!(peer.send_event("metadata_update_success", json!({"conversation_id": "other"})).await);
            assert!(peer.send_event("metadata_update_success", json!({"conversation_id": "c1", "ok": true})).await);
        });
        assert_eq!(result.unwrap()["ok"], true);
        assert_eq!(sup.correlator().listener_count("metadata_update_success"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn uncorrelated_realtime_exchanges_take_turns() {
        let (path, sup, factory) = build(DeliveryStrategy::Realtime, "http://unused");
        let mut peer = connect(&sup, &factory).await;
        let start = |user: &str| {
            PayloadBuilder::new()
                .field("user_id", json!(user))
                .into_envelope("conversation_start")
        };
        let confirmation =
            || Confirmation::new("conversation_start_success", "conversation start", Duration::from_secs(10));

        let (a, b, ()) = tokio::join!(
            path.confirm(start("u1"), confirmation()),
            path.confirm(start("u2"), confirmation()),
            async {
                let first = peer.recv_json().await.unwrap();
                assert_eq!(first["event"]["event_payload"]["user_id"], "u1");
                assert!(timeout(Duration::from_secs(1), peer.recv()).await.is_err());
                assert!(peer.send_event("conversation_start_success", json!({"conversation_id": "c1"})).await);

                let second = peer.recv_json().await.unwrap();
                assert_eq!(second["event"]["event_payload"]["user_id"], "u2");
                assert!(peer.send_event("conversation_start_success", json!({"conversation_id": "c2"})).await);
            }
        );
        assert_eq!(a.unwrap()["conversation_id"], "c1");
        assert_eq!(b.unwrap()["conversation_id"], "c2");
        assert_eq!(sup.correlator().listener_count("conversation_start_success"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_confirm_times_out_and_cleans_up() {
        let (path, sup, factory) = build(DeliveryStrategy::Realtime, "http://unused");
        let _peer = connect(&sup, &factory).await;

        let confirmation = Confirmation::new("metadata_update_success", "metadata update", Duration::from_secs(15))
            .conversation(&ConversationId::from("c1"));
        let err = path.confirm(metadata_envelope(), confirmation).await.unwrap_err();
        assert_eq!(err.to_string(), "Timeout: No response for metadata update after 15000ms");
        assert_eq!(sup.correlator().listener_count("metadata_update_success"), 0);
    }

    #[tokio::test]
    async fn rest_confirm_attaches_socket_id() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/events"))
            .and(wiremock::matchers::body_partial_json(json!({"event": {"socket_id": "s1"}})))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({
                "event": {"event_type": "metadata_update_success", "event_payload": {"conversation_id": "c1"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (path, sup, factory) = build(DeliveryStrategy::Rest, &server.uri());
        let _peer = connect(&sup, &factory).await;
        let confirmation = Confirmation::new("metadata_update_success", "metadata update", Duration::from_secs(15));
        let payload = path.confirm(metadata_envelope(), confirmation).await.unwrap();
        assert_eq!(payload["conversation_id"], "c1");
    }

    #[tokio::test]
    async fn rest_confirm_requires_socket_id() {
        let (path, _sup, _factory) = build(DeliveryStrategy::Rest, "http://unused");
        let confirmation = Confirmation::new("metadata_update_success", "metadata update", Duration::from_secs(1));
        let err = path.confirm(metadata_envelope(), confirmation).await.unwrap_err();
        assert_matches!(err, ParleyError::Transport { .. });
    }

    #[tokio::test]
    async fn fire_fails_when_not_connected() {
        let (path, _sup, _factory) = build(DeliveryStrategy::Realtime, "http://unused");
        let err = path.fire(&metadata_envelope()).await.unwrap_err();
        assert_matches!(err, ParleyError::Transport { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn guard_reports_reconnect_failure_without_running_operation() {
        let (path, _sup, factory) = build(DeliveryStrategy::Realtime, "http://unused");
        factory.fail_next(10);
        let mut ran = false;
        let err = path
            .guarded("send message", async {
                ran = true;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(!ran);
        assert_matches!(err, ParleyError::ReconnectGuard { ref operation, .. } if operation == "send message");
        assert!(err.to_string().contains("Reconnection failed after 2 attempts"));
    }

    #[tokio::test]
    async fn guard_skips_reconnect_when_active() {
        let (path, sup, factory) = build(DeliveryStrategy::Realtime, "http://unused");
        let _peer = connect(&sup, &factory).await;
        let value = path.guarded("noop", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(factory.open_count(), 1);
    }
}
