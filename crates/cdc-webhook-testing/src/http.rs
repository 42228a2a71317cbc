//! HTTP sink mocking for webhook delivery tests.

use http::HeaderMap;
use serde_json::Value;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

const HOOK_PATH: &str = "/hook";

/// Webhook sink backed by a wiremock server.
///
/// Every mounted response matches `POST /hook`; [`MockSink::url`] points
/// there.
pub struct MockSink {
    server: MockServer,
}

impl MockSink {
    /// Starts a sink on a random port.
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    /// URL webhooks should be sent to.
    pub fn url(&self) -> String {
        format!("{}{HOOK_PATH}", self.server.uri())
    }

    /// Answers every request with `status`.
    pub async fn respond_always(&self, status: u16) {
        Mock::given(method("POST"))
            .and(path(HOOK_PATH))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Answers every request with `status` and `body`.
    pub async fn respond_with_body(&self, status: u16, body: impl Into<String>) {
        Mock::given(method("POST"))
            .and(path(HOOK_PATH))
            .respond_with(ResponseTemplate::new(status).set_body_string(body.into()))
            .mount(&self.server)
            .await;
    }

    /// Answers with `statuses` in order, repeating the last one forever.
    pub async fn respond_sequence(&self, statuses: &[u16]) {
        let Some((last, leading)) = statuses.split_last() else {
            return;
        };

        for status in leading {
            Mock::given(method("POST"))
                .and(path(HOOK_PATH))
                .respond_with(ResponseTemplate::new(*status))
                .up_to_n_times(1)
                .mount(&self.server)
                .await;
        }
        self.respond_always(*last).await;
    }

    /// Answers `status` only to requests carrying `name: value`.
    pub async fn require_header(&self, name: &str, value: &str, status: u16) {
        Mock::given(method("POST"))
            .and(path(HOOK_PATH))
            .and(header(name, value))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Every request received so far.
    pub async fn requests(&self) -> Vec<Request> {
        self.server.received_requests().await.unwrap_or_default()
    }

    /// Number of requests received so far.
    pub async fn request_count(&self) -> usize {
        self.requests().await.len()
    }

    /// Request bodies parsed as JSON, in arrival order.
    ///
    /// # Panics
    ///
    /// Panics if a body is not valid JSON.
    pub async fn bodies(&self) -> Vec<Value> {
        self.requests()
            .await
            .iter()
            .map(|request| serde_json::from_slice(&request.body).expect("request body is not JSON"))
            .collect()
    }

    /// Headers of the `index`-th request.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `index + 1` requests arrived.
    pub async fn headers(&self, index: usize) -> HeaderMap {
        self.requests().await[index].headers.clone()
    }

    /// Asserts that exactly `expected` requests were received.
    pub async fn assert_request_count(&self, expected: usize) {
        let actual = self.request_count().await;
        assert_eq!(actual, expected, "expected {expected} webhook requests, received {actual}");
    }
}

/// Assertions over received requests.
pub mod assertions {
    use super::*;

    /// Asserts that `headers` contains `name: value`.
    pub fn assert_header(headers: &HeaderMap, name: &str, value: &str) {
        let actual = headers
            .get(name)
            .unwrap_or_else(|| panic!("header '{name}' not present"))
            .to_str()
            .unwrap_or_else(|_| panic!("header '{name}' is not ASCII"));
        assert_eq!(actual, value, "header '{name}' has unexpected value");
    }

    /// Asserts the `delivery_info` block of each body, in order.
    pub fn assert_delivery_info(bodies: &[Value], max_retries: u32) {
        for (index, body) in bodies.iter().enumerate() {
            assert_eq!(
                body["delivery_info"],
                serde_json::json!({"max_retries": max_retries, "current_retry": index}),
                "request {index} carries unexpected delivery_info"
            );
        }
    }
}
