//! Authenticated HTTP side channel.
//!
//! Two uses: REST-style confirmed operations (POST the envelope, read the
//! reply frame from the response body) and out-of-band retrieval of
//! oversized messages. Every request carries the `x-api-key` header.

use std::time::Duration;

use parley_core::constants::API_KEY_HEADER;
use parley_core::constants::inbound::GENERAL_ERROR;
use parley_core::envelope::{Envelope, InboundFrame, RemoteErrorEvent};
use parley_core::{ApiKey, ParleyError, Result};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Path segment for REST-delivered envelopes, relative to the HTTP base URL.
pub const EVENTS_PATH: &str = "events";

/// HTTP client bound to one credential and base URL.
#[derive(Clone)]
pub struct HttpSideChannel {
    client: reqwest::Client,
    base_url: Url,
    api_key: ApiKey,
    timeout: Duration,
}

impl HttpSideChannel {
    /// Create a side channel. `timeout` bounds every request.
    pub fn new(client: reqwest::Client, base_url: Url, api_key: ApiKey, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            api_key,
            timeout,
        }
    }

    /// URL that REST envelopes are posted to.
    pub fn events_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        let _ = url
            .path_segments_mut()
            .map_err(|()| ParleyError::validation("http side channel", "base URL cannot be a base"))?
            .pop_if_empty()
            .push(EVENTS_PATH);
        Ok(url)
    }

    /// POST `envelope` and return the reply frame from the response body.
    ///
    /// A `general_error` reply becomes [`ParleyError::Remote`].
    pub async fn post_envelope(&self, envelope: &Envelope, operation: &str) -> Result<InboundFrame> {
        let url = self.events_url()?;
        debug!(%url, event_type = envelope.event_type(), operation, "posting envelope");

        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, self.api_key.expose())
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(envelope)
            .send()
            .await
            .map_err(|e| request_error(operation, &e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| request_error(operation, &e))?;
        if !status.is_success() {
            return Err(ParleyError::Http {
                operation: operation.to_string(),
                status: status.as_u16(),
                message: body,
            });
        }

        let frame = InboundFrame::parse(&body)?;
        if frame.event_type() == GENERAL_ERROR {
            return Err(RemoteErrorEvent::from_payload(frame.payload()).into_error());
        }
        Ok(frame)
    }

    /// GET `link`. JSON bodies are parsed; anything else comes back as a
    /// JSON string.
    pub async fn fetch_link(&self, link: &str) -> Result<Value> {
        debug!(link, "fetching out-of-band payload");
        let response = self
            .client
            .get(link)
            .header(API_KEY_HEADER, self.api_key.expose())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| request_error("large message fetch", &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| request_error("large message fetch", &e))?;
        if !status.is_success() {
            return Err(ParleyError::Http {
                operation: "large message fetch".into(),
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

fn request_error(operation: &str, err: &reqwest::Error) -> ParleyError {
    if err.is_timeout() {
        ParleyError::Transport {
            message: format!("{operation} request timed out"),
        }
    } else {
        ParleyError::transport(format!("{operation} request failed: {err}"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parley_core::envelope::PayloadBuilder;
    use parley_core::{ConversationId, SocketId};
    use serde_json::json;

    fn channel(base: &str) -> HttpSideChannel {
        HttpSideChannel::new(
            reqwest::Client::new(),
            Url::parse(base).unwrap(),
            ApiKey::new("key-1234"),
            Duration::from_secs(5),
        )
    }

    fn envelope() -> Envelope {
        PayloadBuilder::new()
            .conversation(&ConversationId::from("c1"))
            .field("metadata", json!({"a": 1}))
            .into_envelope("update_metadata")
            .with_socket_id(SocketId::from("s1"))
    }

    #[test]
    fn events_url_appends_segment() {
        assert_eq!(
            channel("https://api.example.com/v1").events_url().unwrap().as_str(),
            "https://api.example.com/v1/events"
        );
        assert_eq!(
            channel("https://api.example.com/v1/").events_url().unwrap().as_str(),
            "https://api.example.com/v1/events"
        );
    }

    #[tokio::test]
    async fn post_envelope_returns_reply_frame() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/events"))
            .and(wiremock::matchers::header("x-api-key", "key-1234"))
            .and(wiremock::matchers::body_partial_json(json!({
                "action": "sendMessage",
                "event": {
                    "event_type": "update_metadata",
                    "socket_id": "s1",
                    "event_payload": {"conversation_id": "c1"}
                }
            })))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({
                "event": {
                    "event_type": "metadata_update_success",
                    "event_payload": {"conversation_id": "c1"}
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let frame = channel(&server.uri())
            .post_envelope(&envelope(), "metadata update")
            .await
            .unwrap();
        assert_eq!(frame.event_type(), "metadata_update_success");
        assert_eq!(frame.payload()["conversation_id"], "c1");
    }

    #[tokio::test]
    async fn general_error_reply_is_remote_error() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({
                "event": {
                    "event_type": "general_error",
                    "event_payload": {"error_code": 404, "error_desc": "conversation not found"}
                }
            })))
            .mount(&server)
            .await;

        let err = channel(&server.uri())
            .post_envelope(&envelope(), "metadata update")
            .await
            .unwrap_err();
        assert_matches!(err, ParleyError::Remote { ref code, .. } if code == "404");
        assert!(err.to_string().contains("conversation not found"));
    }

    #[tokio::test]
    async fn non_success_status_is_http_error() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = channel(&server.uri())
            .post_envelope(&envelope(), "metadata update")
            .await
            .unwrap_err();
        assert_matches!(err, ParleyError::Http { status: 503, .. });
        assert!(err.to_string().contains("metadata update"));
    }

    #[tokio::test]
    async fn malformed_reply_is_protocol_error() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let err = channel(&server.uri())
            .post_envelope(&envelope(), "metadata update")
            .await
            .unwrap_err();
        assert_matches!(err, ParleyError::Protocol { .. });
    }

    #[tokio::test]
    async fn fetch_link_sends_credential_and_parses_json() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/large/1"))
            .and(wiremock::matchers::header("x-api-key", "key-1234"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({"content": "big"})))
            .mount(&server)
            .await;

        let body = channel(&server.uri())
            .fetch_link(&format!("{}/large/1", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, json!({"content": "big"}));
    }

    #[tokio::test]
    async fn fetch_link_plain_text_body() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("just text"))
            .mount(&server)
            .await;

        let body = channel(&server.uri())
            .fetch_link(&format!("{}/anything", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, json!("just text"));
    }

    #[tokio::test]
    async fn fetch_link_failure_status() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(404).set_body_string("gone"))
            .mount(&server)
            .await;

        let err = channel(&server.uri())
            .fetch_link(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert_matches!(err, ParleyError::Http { status: 404, .. });
    }
}
