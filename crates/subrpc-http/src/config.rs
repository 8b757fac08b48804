//! HTTP provider configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subrpc_core::cache::{DEFAULT_CAPACITY, DEFAULT_TTL};
use subrpc_core::TransportError;

/// Configuration for [`HttpProvider`](crate::HttpProvider).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    /// `http://` or `https://` endpoint.
    pub endpoint: String,
    /// Per-request timeout.
    pub timeout_ms: u64,
    /// Call cache entries; 0 disables caching.
    pub cache_capacity: usize,
    /// Sliding TTL of cached calls; `None` keeps entries until evicted.
    pub cache_ttl_ms: Option<u64>,
    /// Extra headers sent with every request.
    pub headers: HashMap<String, String>,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9933".into(),
            timeout_ms: 60_000,
            cache_capacity: DEFAULT_CAPACITY,
            cache_ttl_ms: Some(DEFAULT_TTL.as_millis() as u64),
            headers: HashMap::new(),
        }
    }
}

impl HttpProviderConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(TransportError::Config(format!(
                "endpoint should start with 'http://' or 'https://', received '{}'",
                self.endpoint
            )));
        }
        if self.timeout_ms == 0 {
            return Err(TransportError::Config("timeout_ms must be positive".into()));
        }
        crate::exchange::header_map(&self.headers)?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_ms.map(Duration::from_millis)
    }
}
