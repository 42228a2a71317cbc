//! HTTP executor for single webhook attempts.
//!
//! One call to [`DeliveryClient::execute`] is exactly one POST. Retries are
//! the caller's business. Every failure, including transport failures, comes
//! back as a [`DeliveryOutcome`] rather than an error so that callers can
//! record it and decide what to do next.

use std::{error::Error as StdError, time::Duration};

use bytes::Bytes;
use cdc_webhook_core::{DeliveryOutcome, EventId, WebhookHeaders, WebhookTarget};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Largest response snapshot kept per attempt, suffix included.
pub const MAX_SNAPSHOT_BYTES: usize = 1024;

const TRUNCATED_SUFFIX: &str = "... (truncated)";

/// Configuration for the webhook HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// User agent sent with every request.
    pub user_agent: String,
    /// Redirects to follow; zero treats any 3xx as a failed attempt.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("cdc-webhook/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 0,
        }
    }
}

/// One attempt to send.
#[derive(Debug, Clone)]
pub struct AttemptRequest<'a> {
    /// Event being delivered, for log correlation.
    pub event_id: EventId,
    /// 1-based attempt number within the sequence.
    pub attempt: u32,
    /// Serialized wire payload.
    pub body: Bytes,
    /// Destination.
    pub target: &'a WebhookTarget,
}

/// HTTP client performing single webhook attempts.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let redirect = match config.max_redirects {
            0 => reqwest::redirect::Policy::none(),
            n => reqwest::redirect::Policy::limited(usize::try_from(n).unwrap_or(usize::MAX)),
        };

        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(redirect)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Creates a delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Performs one POST and classifies the result.
    ///
    /// Headers go out in resolved order with `Content-Type` first. The
    /// target's timeout bounds the whole exchange.
    pub async fn execute(&self, request: AttemptRequest<'_>) -> DeliveryOutcome {
        let target = request.target;
        let span = info_span!(
            "webhook_attempt",
            event_id = %request.event_id,
            attempt = request.attempt,
            timeout_seconds = target.timeout_seconds,
        );

        async move {
            debug!(headers = ?target.headers, "sending webhook request");

            let mut http_request =
                self.client.post(&target.url).timeout(target.timeout()).body(request.body);
            for (name, value) in target.headers.resolved() {
                http_request = http_request.header(name, value);
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let detail = transport_detail(&e, target.timeout(), &target.headers);
                    warn!(error = %detail, "webhook request failed");
                    return DeliveryOutcome::transport(detail);
                },
            };

            let status = response.status().as_u16();
            let snapshot = match response.bytes().await {
                Ok(bytes) => snapshot_body(&bytes, &target.headers),
                Err(e) => {
                    let detail = target.headers.redact(&error_chain(&e));
                    format!("[failed to read response body: {detail}]")
                },
            };

            if (200..300).contains(&status) {
                debug!(status, "webhook delivered");
            } else {
                warn!(status, "webhook sink rejected request");
            }

            DeliveryOutcome::from_status(status, Some(snapshot))
        }
        .instrument(span)
        .await
    }
}

/// Redacted, size-bounded copy of a response body.
fn snapshot_body(bytes: &[u8], headers: &WebhookHeaders) -> String {
    let text = headers.redact(&String::from_utf8_lossy(bytes));
    truncate(text)
}

fn truncate(text: String) -> String {
    if text.len() <= MAX_SNAPSHOT_BYTES {
        return text;
    }

    let mut end = MAX_SNAPSHOT_BYTES - TRUNCATED_SUFFIX.len();
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATED_SUFFIX}", &text[..end])
}

fn transport_detail(error: &reqwest::Error, timeout: Duration, headers: &WebhookHeaders) -> String {
    let detail = if error.is_timeout() {
        format!("request timed out after {}s", timeout.as_secs())
    } else {
        error_chain(error)
    };
    headers.redact(&detail)
}

/// Error text with its source chain, `outer: inner: root`.
fn error_chain(error: &dyn StdError) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn target(url: String, headers: &[(&str, &str)], timeout_seconds: u32) -> WebhookTarget {
        WebhookTarget::new(url, headers.iter().copied().collect(), timeout_seconds)
    }

    fn request(target: &WebhookTarget) -> AttemptRequest<'_> {
        AttemptRequest {
            event_id: EventId::new(),
            attempt: 1,
            body: Bytes::from_static(br#"{"id":"x"}"#),
            target,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::header("Content-Type", "application/json"))
            .and(matchers::header("X-Api-Key", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let target = target(format!("{}/hook", mock_server.uri()), &[("X-Api-Key", "abc")], 5);

        let outcome = client.execute(request(&target)).await;

        assert!(outcome.success);
        assert_eq!(outcome.http_status, Some(200));
        assert!(outcome.error_detail.is_none());
        assert_eq!(outcome.response_snapshot.as_deref(), Some("OK"));
    }

    #[tokio::test]
    async fn non_2xx_status_is_failure_with_status_detail() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let target = target(mock_server.uri(), &[], 5);

        let outcome = client.execute(request(&target)).await;

        assert!(!outcome.success);
        assert_eq!(outcome.http_status, Some(401));
        assert_eq!(outcome.error_detail.as_deref(), Some("HTTP 401"));
    }

    #[tokio::test]
    async fn redirect_is_not_followed_by_default() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(302).append_header("Location", "/elsewhere"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let target = target(mock_server.uri(), &[], 5);

        let outcome = client.execute(request(&target)).await;

        assert!(!outcome.success);
        assert_eq!(outcome.http_status, Some(302));
    }

    #[tokio::test]
    async fn caller_content_type_is_sent_instead_of_default() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header("content-type", "application/cloudevents+json"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let target =
            target(mock_server.uri(), &[("Content-Type", "application/cloudevents+json")], 5);

        assert!(client.execute(request(&target)).await.success);
    }

    #[tokio::test]
    async fn connection_refused_is_transport_failure() {
        let client = DeliveryClient::with_defaults().unwrap();
        let target = target("http://127.0.0.1:1/hook".to_string(), &[], 2);

        let outcome = client.execute(request(&target)).await;

        assert!(!outcome.success);
        assert!(outcome.http_status.is_none());
        assert!(outcome.error_detail.unwrap().starts_with("transport error: "));
    }

    #[tokio::test]
    async fn slow_sink_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let target = target(mock_server.uri(), &[], 1);

        let outcome = client.execute(request(&target)).await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.error_detail.as_deref(),
            Some("transport error: request timed out after 1s")
        );
    }

    #[tokio::test]
    async fn response_snapshot_hides_header_values() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(401).set_body_string("token secretvalue is not valid"),
            )
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let target = target(mock_server.uri(), &[("Authorization", "secretvalue")], 5);

        let outcome = client.execute(request(&target)).await;

        let snapshot = outcome.response_snapshot.unwrap();
        assert!(!snapshot.contains("secretvalue"));
        assert_eq!(snapshot, "token *** is not valid");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "a".repeat(5000);
        let snapshot = snapshot_body(body.as_bytes(), &WebhookHeaders::new());

        assert_eq!(snapshot.len(), MAX_SNAPSHOT_BYTES);
        assert!(snapshot.ends_with(TRUNCATED_SUFFIX));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = "é".repeat(2000);
        let snapshot = snapshot_body(body.as_bytes(), &WebhookHeaders::new());

        assert!(snapshot.len() <= MAX_SNAPSHOT_BYTES);
        assert!(snapshot.ends_with(TRUNCATED_SUFFIX));
    }

    #[test]
    fn short_bodies_are_kept_whole() {
        assert_eq!(snapshot_body(b"accepted", &WebhookHeaders::new()), "accepted");
    }

    proptest::proptest! {
        #[test]
        fn snapshots_are_bounded_and_scrubbed(
            prefix in "[a-z ]{0,1500}",
            suffix in "[a-z ]{0,1500}",
        ) {
            let headers: WebhookHeaders = [("Authorization", "s3cr3t-token")].into_iter().collect();
            let body = format!("{prefix}s3cr3t-token{suffix}");

            let snapshot = snapshot_body(body.as_bytes(), &headers);

            proptest::prop_assert!(snapshot.len() <= MAX_SNAPSHOT_BYTES);
            proptest::prop_assert!(!snapshot.contains("s3cr3t-token"));
        }
    }
}
