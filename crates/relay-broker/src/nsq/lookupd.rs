//! nsqlookupd discovery.

use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::error::BrokerError;

/// An nsqd instance hosting a topic.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Producer {
    pub broadcast_address: String,
    pub tcp_port: u16,
}

impl Producer {
    /// `host:port` of the producer's TCP listener.
    #[must_use]
    pub fn tcp_address(&self) -> String {
        if self.broadcast_address.contains(':') {
            format!("[{}]:{}", self.broadcast_address, self.tcp_port)
        } else {
            format!("{}:{}", self.broadcast_address, self.tcp_port)
        }
    }
}

/// `/lookup` body. Older lookupd versions wrap it in `data`.
#[derive(Debug, Default, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<Producer>,
    #[serde(default)]
    data: Option<LookupData>,
}

#[derive(Debug, Default, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

impl LookupResponse {
    fn into_producers(self) -> Vec<Producer> {
        match self.data {
            Some(data) if self.producers.is_empty() => data.producers,
            _ => self.producers,
        }
    }
}

/// Parse a `/lookup` response body.
///
/// # Errors
///
/// Returns an error if the body is not a lookup response.
pub fn parse_lookup(body: &[u8]) -> Result<Vec<Producer>, BrokerError> {
    serde_json::from_slice::<LookupResponse>(body)
        .map(LookupResponse::into_producers)
        .map_err(|e| BrokerError::Discovery(format!("invalid lookup response: {}", e)))
}

/// Base URL for an address given as `host:port` or a full URL.
pub(crate) fn http_base(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Queries one or more nsqlookupd instances.
#[derive(Debug, Clone)]
pub struct LookupClient {
    http: reqwest::Client,
    addresses: Vec<String>,
}

impl LookupClient {
    pub fn new(http: reqwest::Client, addresses: Vec<String>) -> Self {
        Self { http, addresses }
    }

    /// Producers of `topic` known to one lookupd.
    ///
    /// A 404 means the topic does not exist yet and yields no producers.
    pub async fn lookup(&self, address: &str, topic: &str) -> Result<Vec<Producer>, BrokerError> {
        let url = format!("{}/lookup?topic={}", http_base(address), topic);
        let response = self.http.get(&url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(lookupd = %address, topic = %topic, "Topic not registered yet");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(BrokerError::Discovery(format!(
                "{} answered {}",
                address, status
            )));
        }

        let body = response.bytes().await?;
        parse_lookup(&body)
    }

    /// TCP addresses of every producer of `topic`, across all lookupds.
    ///
    /// # Errors
    ///
    /// Fails only if no lookupd could be queried.
    pub async fn producers(&self, topic: &str) -> Result<BTreeSet<String>, BrokerError> {
        if self.addresses.is_empty() {
            return Err(BrokerError::Config("no lookupd addresses configured".into()));
        }

        let mut found = BTreeSet::new();
        let mut failures = Vec::new();
        for address in &self.addresses {
            match self.lookup(address, topic).await {
                Ok(producers) => found.extend(producers.iter().map(Producer::tcp_address)),
                Err(e) => {
                    warn!(lookupd = %address, error = %e, "Lookup failed");
                    failures.push(format!("{}: {}", address, e));
                }
            }
        }

        if failures.len() == self.addresses.len() {
            return Err(BrokerError::Discovery(failures.join("; ")));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, http::StatusCode, routing::get, Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_flat_response() {
        let body = br#"{"channels":["a"],"producers":[{"broadcast_address":"nsqd-1","hostname":"h","tcp_port":4150,"http_port":4151,"version":"1.3.0"}]}"#;
        let producers = parse_lookup(body).unwrap();
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].tcp_address(), "nsqd-1:4150");
    }

    #[test]
    fn test_parse_wrapped_response() {
        let body = br#"{"status_code":200,"status_txt":"OK","data":{"channels":[],"producers":[{"broadcast_address":"10.0.0.2","tcp_port":4150}]}}"#;
        let producers = parse_lookup(body).unwrap();
        assert_eq!(producers[0].tcp_address(), "10.0.0.2:4150");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_lookup(b"<html>").is_err());
    }

    #[test]
    fn test_ipv6_address() {
        let producer = Producer {
            broadcast_address: "::1".into(),
            tcp_port: 4150,
        };
        assert_eq!(producer.tcp_address(), "[::1]:4150");
    }

    #[test]
    fn test_http_base() {
        assert_eq!(http_base("127.0.0.1:4161"), "http://127.0.0.1:4161");
        assert_eq!(http_base("http://lookupd:4161/"), "http://lookupd:4161");
        assert_eq!(http_base("https://lookupd"), "https://lookupd");
    }

    async fn fake_lookupd() -> String {
        let app = Router::new().route(
            "/lookup",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                match params.get("topic").map(String::as_str) {
                    Some("Chat") => Ok(Json(json!({
                        "producers": [
                            {"broadcast_address": "nsqd-1", "tcp_port": 4150},
                            {"broadcast_address": "nsqd-2", "tcp_port": 4150}
                        ]
                    }))),
                    Some("Broken") => Err(StatusCode::INTERNAL_SERVER_ERROR),
                    _ => Err(StatusCode::NOT_FOUND),
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_producers_across_lookupds() {
        let a = fake_lookupd().await;
        let b = fake_lookupd().await;
        let client = LookupClient::new(reqwest::Client::new(), vec![a, b]);

        let producers = client.producers("Chat").await.unwrap();
        let expected: BTreeSet<String> = ["nsqd-1:4150", "nsqd-2:4150"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(producers, expected);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_empty() {
        let client = LookupClient::new(reqwest::Client::new(), vec![fake_lookupd().await]);
        assert!(client.producers("Nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_tolerated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = LookupClient::new(reqwest::Client::new(), vec![dead.clone(), fake_lookupd().await]);
        assert_eq!(client.producers("Chat").await.unwrap().len(), 2);

        let client = LookupClient::new(reqwest::Client::new(), vec![dead]);
        assert!(matches!(
            client.producers("Chat").await,
            Err(BrokerError::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_failure() {
        let client = LookupClient::new(reqwest::Client::new(), vec![fake_lookupd().await]);
        assert!(client.producers("Broken").await.is_err());
    }
}
