//! Stateless fallback over plain HTTP request/response.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use weft_core::config::{CallOptions, Credentials, SessionConfig};
use weft_core::envelope::{RequestEnvelope, ResponseEnvelope, NOOP_KIND, STATUS_OK};
use weft_core::errors::{ClientError, Result};
use weft_core::events::SessionEvent;

use crate::client::into_payload;

/// One-shot HTTP client presenting the duplex call surface.
///
/// Every call is an independent exchange: there is no correlation table,
/// no keepalive, no replay, and `cancel_pending` has nothing to cancel.
#[derive(Debug)]
pub struct UnaryClient {
    http: reqwest::Client,
    url: String,
    credentials: RwLock<Option<Credentials>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    events: broadcast::Sender<SessionEvent>,
}

impl UnaryClient {
    /// Validates the credentials with a `noop` probe and returns the client.
    pub async fn connect(url: String, credentials: Credentials, config: SessionConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::RequestFailed(e.to_string()))?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let client = Self {
            http,
            url,
            credentials: RwLock::new(Some(credentials)),
            next_id: AtomicU64::new(0),
            request_timeout: config.request_timeout,
            events,
        };
        client.probe().await?;
        info!(url = %client.url, "unary endpoint ready");
        Ok(client)
    }

    async fn probe(&self) -> Result<()> {
        let envelope = self.build_envelope(NOOP_KIND, Map::new())?;
        let response = self.exchange(&envelope, self.request_timeout).await?;
        if response.is_ok() {
            Ok(())
        } else {
            Err(ClientError::from_response(&response))
        }
    }

    pub async fn call(&self, kind: &str, params: Value, options: CallOptions) -> Result<ResponseEnvelope> {
        if options.cancel_pending {
            debug!(kind = %kind, "cancel_pending is a no-op for unary exchanges");
        }
        let payload = into_payload(params)?;
        let envelope = self.build_envelope(kind, payload)?;
        let timeout = options.timeout.unwrap_or(self.request_timeout);
        debug!(kind = %kind, id = envelope.request_id, "unary exchange");
        let response = self.exchange(&envelope, timeout).await?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(ClientError::from_response(&response))
        }
    }

    /// Local-only reset: forgets the credentials and never touches the
    /// network. Idempotent; later calls fail without an exchange.
    pub fn close(&self) {
        if self.credentials.write().take().is_some() {
            debug!("unary credentials cleared");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Assigns the next id and injects stored credentials when the payload
    /// does not carry its own.
    fn build_envelope(&self, kind: &str, mut payload: Map<String, Value>) -> Result<RequestEnvelope> {
        {
            let guard = self.credentials.read();
            let Some(credentials) = guard.as_ref() else {
                return Err(ClientError::SessionClosed);
            };
            if !payload.contains_key("apiKey") {
                payload.insert("apiKey".into(), Value::String(credentials.api_key.clone()));
                payload.insert(
                    "apiSecret".into(),
                    Value::String(credentials.expose_secret().to_string()),
                );
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(RequestEnvelope::new(kind, id, payload))
    }

    async fn exchange(&self, envelope: &RequestEnvelope, timeout: Duration) -> Result<ResponseEnvelope> {
        let timed_out = || ClientError::TimedOut {
            kind: envelope.request_type.clone(),
            id: envelope.request_id,
        };
        let response = self
            .http
            .post(&self.url)
            .timeout(timeout)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    timed_out()
                } else {
                    ClientError::RequestFailed(e.to_string())
                }
            })?;
        let status = response.status();
        if status.as_u16() != STATUS_OK {
            return Err(ClientError::Http {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }
        response.json::<ResponseEnvelope>().await.map_err(|e| {
            if e.is_timeout() {
                timed_out()
            } else {
                ClientError::Malformed(e.to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::client::Client;

    fn creds() -> Credentials {
        Credentials::new("key-1", "secret-1")
    }

    fn ok_body(kind: &str, id: u64) -> Value {
        json!({
            "requestType": kind,
            "requestId": id,
            "statusCode": 200,
            "statusMessage": ["OK"],
        })
    }

    async fn mount_ok(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("noop", 0)))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn connect_probes_with_noop_and_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(json!({
                "requestType": "noop",
                "requestId": 0,
                "apiKey": "key-1",
                "apiSecret": "secret-1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("noop", 0)))
            .expect(1)
            .mount(&server)
            .await;

        // The facade routes http URLs here.
        let client = Client::connect(server.uri(), creds(), SessionConfig::default()).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn connect_rejects_on_server_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "requestType": "noop",
                "requestId": 0,
                "statusCode": 401,
                "statusMessage": ["Missing API key or secret"],
            })))
            .mount(&server)
            .await;

        let err = UnaryClient::connect(server.uri(), creds(), SessionConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Server error (401): Missing API key or secret");
    }

    #[tokio::test]
    async fn connect_rejects_on_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = UnaryClient::connect(server.uri(), creds(), SessionConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "HTTP error (503): Service Unavailable");
    }

    #[tokio::test]
    async fn calls_carry_increasing_ids_and_injected_credentials() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let client = UnaryClient::connect(server.uri(), creds(), SessionConfig::default())
            .await
            .unwrap();

        client.call("searchSymptom", json!({"term": "fever"}), CallOptions::default()).await.unwrap();
        client.call("searchSymptom", json!({"term": "cough"}), CallOptions::default()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let bodies: Vec<Value> = requests
            .iter()
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect();
        assert_eq!(bodies.len(), 3);
        // Probe first, then the two calls, one id each.
        assert_eq!(bodies[0]["requestType"], "noop");
        assert_eq!(bodies[0]["requestId"], 0);
        assert_eq!(bodies[1]["requestId"], 1);
        assert_eq!(bodies[1]["term"], "fever");
        assert_eq!(bodies[2]["requestId"], 2);
        for body in &bodies {
            assert_eq!(body["apiKey"], "key-1");
            assert_eq!(body["apiSecret"], "secret-1");
        }
    }

    #[tokio::test]
    async fn explicit_credentials_in_payload_are_preserved() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let client = UnaryClient::connect(server.uri(), creds(), SessionConfig::default())
            .await
            .unwrap();

        client
            .call("searchSymptom", json!({"apiKey": "other-key"}), CallOptions::default())
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests.last().unwrap().body).unwrap();
        assert_eq!(body["apiKey"], "other-key");
        assert!(body.get("apiSecret").is_none());
    }

    #[tokio::test]
    async fn call_maps_server_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"requestType": "noop"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("noop", 0)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"requestType": "analyzeAnswers"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "requestType": "analyzeAnswers",
                "requestId": 1,
                "statusCode": 500,
                "statusMessage": ["boom", "try later"],
            })))
            .mount(&server)
            .await;
        let client = UnaryClient::connect(server.uri(), creds(), SessionConfig::default())
            .await
            .unwrap();

        let err = client
            .call("analyzeAnswers", json!({}), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Server error (500): boom; try later");
    }

    #[tokio::test]
    async fn call_times_out_on_slow_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"requestType": "noop"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("noop", 0)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"requestType": "searchSymptom"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(ok_body("searchSymptom", 1))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let client = UnaryClient::connect(server.uri(), creds(), SessionConfig::default())
            .await
            .unwrap();

        let err = client
            .call(
                "searchSymptom",
                json!({}),
                CallOptions::timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::TimedOut { id: 1, .. }));
        assert_eq!(err.to_string(), "Request timed out: 1, searchSymptom");
    }

    #[tokio::test]
    async fn malformed_body_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"requestType": "noop"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("noop", 0)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"requestType": "searchSymptom"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;
        let client = UnaryClient::connect(server.uri(), creds(), SessionConfig::default())
            .await
            .unwrap();

        let err = client
            .call("searchSymptom", json!({}), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Malformed(_)));
    }

    #[tokio::test]
    async fn close_clears_credentials_and_later_calls_fail_locally() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let client = UnaryClient::connect(server.uri(), creds(), SessionConfig::default())
            .await
            .unwrap();
        let before = server.received_requests().await.unwrap().len();

        client.close();
        client.close();

        let err = client
            .call("searchSymptom", json!({}), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::SessionClosed));
        assert_eq!(server.received_requests().await.unwrap().len(), before);
    }
}
