//! WebSocket provider configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subrpc_core::cache::{DEFAULT_CAPACITY, DEFAULT_TTL};
use subrpc_core::policy::{BackoffConfig, BackoffPolicy};
use subrpc_core::TransportError;

/// Configuration for [`WsProvider`](crate::WsProvider).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsProviderConfig {
    /// `ws://` or `wss://` endpoints, tried in rotation on every (re)connect.
    pub endpoints: Vec<String>,
    /// Delay before a reconnect attempt; 0 disables auto-reconnect.
    pub auto_connect_ms: u64,
    /// Cap for the reconnect delay when `reconnect_multiplier > 1`.
    pub reconnect_max_ms: u64,
    /// Growth factor of the reconnect delay per failed attempt.
    pub reconnect_multiplier: f64,
    /// A pending request older than this fails with a timeout.
    pub timeout_ms: u64,
    /// Period of the stale-request sweep.
    pub sweep_interval_ms: u64,
    /// Call cache entries; 0 disables caching.
    pub cache_capacity: usize,
    /// Sliding TTL of cached calls; `None` keeps entries until evicted.
    pub cache_ttl_ms: Option<u64>,
    /// Extra headers for the WebSocket handshake.
    pub headers: HashMap<String, String>,
}

impl Default for WsProviderConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["ws://127.0.0.1:9944".into()],
            auto_connect_ms: 2_500,
            reconnect_max_ms: 60_000,
            reconnect_multiplier: 1.0,
            timeout_ms: 60_000,
            sweep_interval_ms: 5_000,
            cache_capacity: DEFAULT_CAPACITY,
            cache_ttl_ms: Some(DEFAULT_TTL.as_millis() as u64),
            headers: HashMap::new(),
        }
    }
}

impl WsProviderConfig {
    /// Default configuration for a single endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            ..Self::default()
        }
    }

    /// Default configuration rotating over `endpoints`.
    pub fn with_endpoints(endpoints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Check endpoints and timings. Cache parameters are checked when the
    /// cache is built.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.endpoints.is_empty() {
            return Err(TransportError::Config("endpoint list is empty".into()));
        }
        if let Some(bad) = self
            .endpoints
            .iter()
            .find(|e| !(e.starts_with("ws://") || e.starts_with("wss://")))
        {
            return Err(TransportError::Config(format!(
                "endpoint should start with 'ws://' or 'wss://', received '{bad}'"
            )));
        }
        if self.timeout_ms == 0 {
            return Err(TransportError::Config("timeout_ms must be positive".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(TransportError::Config("sweep_interval_ms must be positive".into()));
        }
        crate::connector::header_pairs(&self.headers)?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_ms.map(Duration::from_millis)
    }

    /// Reconnect policy, or `None` when auto-reconnect is disabled.
    pub fn backoff(&self) -> Option<BackoffPolicy> {
        if self.auto_connect_ms == 0 {
            return None;
        }
        Some(BackoffPolicy::new(BackoffConfig {
            initial: Duration::from_millis(self.auto_connect_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
            multiplier: self.reconnect_multiplier,
        }))
    }
}
