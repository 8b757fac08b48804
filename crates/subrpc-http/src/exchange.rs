//! One request/response exchange per call.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};

use subrpc_core::TransportError;

use crate::config::HttpProviderConfig;

/// Posts one serialized JSON-RPC request and returns the raw reply body.
#[async_trait]
pub trait HttpExchange: Send + Sync + 'static {
    async fn post(&self, body: String) -> Result<String, TransportError>;
}

pub(crate) fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Config(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Config(format!("header value for {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// [`HttpExchange`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestExchange {
    url: String,
    timeout_ms: u64,
    http: reqwest::Client,
}

impl ReqwestExchange {
    pub fn new(config: &HttpProviderConfig) -> Result<Self, TransportError> {
        let mut headers = header_map(&config.headers)?;
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: config.endpoint.clone(),
            timeout_ms: config.timeout_ms,
            http,
        })
    }
}

#[async_trait]
impl HttpExchange for ReqwestExchange {
    async fn post(&self, body: String) -> Result<String, TransportError> {
        let resp = self
            .http
            .post(&self.url)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout { ms: self.timeout_ms }
                } else {
                    TransportError::Http(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        resp.text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }
}
