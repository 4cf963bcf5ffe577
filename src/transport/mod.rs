//! HTTP boundary contract (C2) and its default `reqwest`-backed implementation.
//!
//! No retries live inside this contract; the core wraps every call through
//! [`crate::resilience`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub type HeaderMap = HashMap<String, String>;

/// Response from any of [`HttpTransport`]'s methods.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_as_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(String),
    #[error("transport request timed out")]
    Timeout,
}

pub type TransportResult = Result<TransportResponse, TransportError>;

/// External collaborator contract for the HTTP boundary (out of scope per
/// the specification; only the contract and one default implementation
/// live in this crate).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
        headers: HeaderMap,
        timeout: Duration,
    ) -> TransportResult;

    async fn get(&self, url: &str, headers: HeaderMap, timeout: Duration) -> TransportResult;

    async fn head(&self, url: &str, headers: HeaderMap, timeout: Duration) -> TransportResult;
}

/// Default [`HttpTransport`] implementation, backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> TransportResult {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Request(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?
            .to_vec();

        Ok(TransportResponse {
            status,
            body,
            headers,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
        headers: HeaderMap,
        timeout: Duration,
    ) -> TransportResult {
        let mut request = self.client.post(url).json(&body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        self.send(request, timeout).await
    }

    async fn get(&self, url: &str, headers: HeaderMap, timeout: Duration) -> TransportResult {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        self.send(request, timeout).await
    }

    async fn head(&self, url: &str, headers: HeaderMap, timeout: Duration) -> TransportResult {
        let mut request = self.client.head(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        self.send(request, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_status_helpers() {
        let response = TransportResponse {
            status: 304,
            body: Vec::new(),
            headers: HeaderMap::new(),
        };
        assert!(response.is_not_modified());
        assert!(!response.is_success());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("ETag".to_string(), "abc".to_string());
        let response = TransportResponse {
            status: 200,
            body: Vec::new(),
            headers,
        };
        assert_eq!(response.header("etag"), Some("abc"));
    }
}
