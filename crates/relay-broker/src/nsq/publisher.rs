//! Publishing through nsqd's HTTP API.

use async_trait::async_trait;
use bytes::Bytes;
use relay_core::{PublishError, Publisher};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::trace;

use crate::error::BrokerError;
use crate::nsq::lookupd::http_base;

/// Publishes to one topic on one nsqd via `POST /pub`.
#[derive(Debug, Clone)]
pub struct NsqPublisher {
    http: reqwest::Client,
    url: String,
}

impl NsqPublisher {
    /// Create a publisher for `topic` on the nsqd at `http_address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the topic is
    /// empty.
    pub fn new(http_address: &str, topic: &str, timeout: Duration) -> Result<Self, BrokerError> {
        if topic.is_empty() {
            return Err(BrokerError::Config("topic must not be empty".into()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: format!("{}/pub?topic={}", http_base(http_address), topic),
        })
    }

    /// Endpoint this publisher posts to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Whether a non-success status may succeed on retry.
fn classify(status: StatusCode, body: &str) -> PublishError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{} {}", status, body.trim())
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PublishError::Retryable(detail)
    } else {
        PublishError::Fatal(detail)
    }
}

#[async_trait]
impl Publisher for NsqPublisher {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        let response = self
            .http
            .post(&self.url)
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    PublishError::Fatal(e.to_string())
                } else {
                    PublishError::Retryable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            trace!(url = %self.url, "Published");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Bytes as Body, extract::Query, http::StatusCode, routing::post, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[test]
    fn test_classify() {
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(classify(StatusCode::INTERNAL_SERVER_ERROR, "E_PUB_FAILED").is_retryable());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!classify(StatusCode::BAD_REQUEST, "E_BAD_TOPIC").is_retryable());
        assert!(!classify(StatusCode::PAYLOAD_TOO_LARGE, "").is_retryable());
    }

    #[test]
    fn test_url() {
        let publisher = NsqPublisher::new("127.0.0.1:4151", "Chat", Duration::from_secs(1)).unwrap();
        assert_eq!(publisher.url(), "http://127.0.0.1:4151/pub?topic=Chat");
        assert!(NsqPublisher::new("127.0.0.1:4151", "", Duration::from_secs(1)).is_err());
    }

    type Received = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    async fn fake_nsqd(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::default();
        let sink = Arc::clone(&received);
        let app = Router::new().route(
            "/pub",
            post(move |Query(params): Query<HashMap<String, String>>, body: Body| {
                let sink = Arc::clone(&sink);
                async move {
                    let topic = params.get("topic").cloned().unwrap_or_default();
                    sink.lock().unwrap().push((topic, body.to_vec()));
                    (status, if status.is_success() { "OK" } else { "E_FAILED" })
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr.to_string(), received)
    }

    #[tokio::test]
    async fn test_publish_posts_payload() {
        let (addr, received) = fake_nsqd(StatusCode::OK).await;
        let publisher = NsqPublisher::new(&addr, "Chat", Duration::from_secs(2)).unwrap();

        publisher
            .publish(Bytes::from_static(br#"{"body":"hi"}"#))
            .await
            .unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "Chat");
        assert_eq!(received[0].1, br#"{"body":"hi"}"#);
    }

    #[tokio::test]
    async fn test_publish_server_error_retryable() {
        let (addr, _) = fake_nsqd(StatusCode::SERVICE_UNAVAILABLE).await;
        let publisher = NsqPublisher::new(&addr, "Chat", Duration::from_secs(2)).unwrap();

        let err = publisher.publish(Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_publish_client_error_fatal() {
        let (addr, _) = fake_nsqd(StatusCode::BAD_REQUEST).await;
        let publisher = NsqPublisher::new(&addr, "Chat", Duration::from_secs(2)).unwrap();

        let err = publisher.publish(Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(matches!(err, PublishError::Fatal(ref detail) if detail.contains("E_FAILED")));
    }

    #[tokio::test]
    async fn test_publish_unreachable_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        let publisher = NsqPublisher::new(&dead, "Chat", Duration::from_secs(2)).unwrap();
        assert!(publisher
            .publish(Bytes::from_static(b"{}"))
            .await
            .unwrap_err()
            .is_retryable());
    }
}
