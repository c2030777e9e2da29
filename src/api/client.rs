use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER};

use super::error::TransportError;
use super::types::SubmissionRequest;

pub const API_URL: &str = "https://api.recordedfuture.com/collective-insights/detections";

const TOKEN_HEADER: &str = "X-RFToken";

/// Whatever came back from the server, error statuses included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    /// Parsed `Retry-After` header, when present and expressed in seconds.
    pub retry_after: Option<Duration>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// One request/response exchange with the detections endpoint.
///
/// Implementations perform exactly one network call per invocation and must
/// not retry on their own.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: &SubmissionRequest<'_>,
    ) -> impl Future<Output = Result<RawResponse, TransportError>> + Send;
}

/// HTTP transport backed by `reqwest`.
pub struct DetectionClient {
    api_token: String,
    client: Client,
    base_url: String,
}

impl DetectionClient {
    pub fn new(api_token: String) -> Result<Self, reqwest::Error> {
        Self::with_base_url(api_token, API_URL.to_string())
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(api_token: String, base_url: String) -> Result<Self, reqwest::Error> {
        Self::with_timeouts(
            api_token,
            base_url,
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
    }

    pub fn with_timeouts(
        api_token: String,
        base_url: String,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            api_token,
            client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Transport for DetectionClient {
    async fn send(&self, request: &SubmissionRequest<'_>) -> Result<RawResponse, TransportError> {
        let response = self
            .client
            .post(&self.base_url)
            .header(TOKEN_HEADER, &self.api_token)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response.text().await?;

        Ok(RawResponse {
            status,
            body,
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{DetectionRecord, SubmitOptions};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample() -> (Vec<DetectionRecord>, SubmitOptions) {
        (
            vec![DetectionRecord::new("ip", "10.0.0.1", "correlation").with_transient_id("t-0")],
            SubmitOptions::default(),
        )
    }

    #[tokio::test]
    async fn posts_payload_with_token_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/detections"))
            .and(header("X-RFToken", "secret"))
            .and(header("accept", "application/json"))
            .and(body_json(json!({
                "options": {"debug": false, "summary": true},
                "data": [{
                    "ioc": {"type": "ip", "value": "10.0.0.1"},
                    "detection": {"type": "correlation"},
                    "transient_id": "t-0"
                }]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"summary": {"submitted": 1, "processed": 1, "dropped": 0}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client =
            DetectionClient::with_base_url("secret".into(), format!("{}/detections", server.uri()))
                .unwrap();
        let (records, options) = sample();
        let resp = client
            .send(&SubmissionRequest::new(&records, &options))
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert!(resp.body.contains("\"processed\":1"));
        assert_eq!(resp.retry_after, None);
    }

    #[tokio::test]
    async fn error_status_is_a_response_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "7")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let client = DetectionClient::with_base_url("t".into(), server.uri()).unwrap();
        let (records, options) = sample();
        let resp = client
            .send(&SubmissionRequest::new(&records, &options))
            .await
            .unwrap();

        assert_eq!(resp.status, 429);
        assert_eq!(resp.body, "slow down");
        assert_eq!(resp.retry_after, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn timeout_maps_to_timeout_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = DetectionClient::with_timeouts(
            "t".into(),
            server.uri(),
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
        .unwrap();
        let (records, options) = sample();
        let err = client
            .send(&SubmissionRequest::new(&records, &options))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connect_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client =
            DetectionClient::with_base_url("t".into(), format!("http://127.0.0.1:{port}")).unwrap();
        let (records, options) = sample();
        let err = client
            .send(&SubmissionRequest::new(&records, &options))
            .await
            .unwrap_err();

        assert!(
            matches!(err, TransportError::Connect(_) | TransportError::Network(_)),
            "got {err:?}"
        );
    }
}
