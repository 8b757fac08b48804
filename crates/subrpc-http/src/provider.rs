//! Stateless HTTP JSON-RPC provider.
//!
//! Every call is one POST. There is no connection to manage and no
//! subscriptions; identical cacheable calls made while one is in flight
//! attach to its outcome instead of issuing another POST.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};

use subrpc_core::codec::decode_reply;
use subrpc_core::events::ProviderEventData;
use subrpc_core::provider::attach_handler;
use subrpc_core::stats::{ActiveStats, EndpointStats, StatsRecorder};
use subrpc_core::{
    CallCache, EventHandler, ProviderEmitter, ProviderEvent, ProviderListener, ProviderStats,
    RpcCodec, RpcProvider, TransportError,
};

use crate::config::HttpProviderConfig;
use crate::exchange::{HttpExchange, ReqwestExchange};

struct Inner {
    config: HttpProviderConfig,
    exchange: Arc<dyn HttpExchange>,
    codec: RpcCodec,
    cache: Option<CallCache>,
    events: ProviderEmitter,
    stats: Mutex<StatsRecorder>,
    in_flight: AtomicU64,
}

/// Decrements the in-flight counter when a call finishes or is dropped.
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// HTTP JSON-RPC provider.
pub struct HttpProvider {
    inner: Arc<Inner>,
}

impl HttpProvider {
    /// Create a provider backed by `reqwest`.
    pub fn new(config: HttpProviderConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let exchange = ReqwestExchange::new(&config)?;
        Self::with_exchange(config, Arc::new(exchange))
    }

    /// Create with default configuration.
    pub fn default_for(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(HttpProviderConfig::new(endpoint))
    }

    /// Create a provider over a custom exchange.
    pub fn with_exchange(
        config: HttpProviderConfig,
        exchange: Arc<dyn HttpExchange>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let cache = CallCache::with_capacity(config.cache_capacity, config.cache_ttl())?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                exchange,
                codec: RpcCodec::new(),
                cache,
                events: ProviderEmitter::new(),
                stats: Mutex::new(StatsRecorder::default()),
                in_flight: AtomicU64::new(0),
            }),
        })
    }

    /// A fresh provider with the same configuration and exchange.
    pub fn duplicate(&self) -> Result<Self, TransportError> {
        Self::with_exchange(self.inner.config.clone(), self.inner.exchange.clone())
    }

    pub fn config(&self) -> &HttpProviderConfig {
        &self.inner.config
    }
}

impl Inner {
    fn record(&self, update: impl Fn(&mut EndpointStats)) {
        self.stats.lock().unwrap().record(update);
    }

    /// One POST; failures carry the method and params that caused them.
    async fn post_call(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let _guard = InFlight::enter(&self.in_flight);
        let (id, body) = self.codec.encode(method, params.clone())?;
        self.record(|s| s.bytes_sent += body.len() as u64);

        let result = match self.exchange.post(body).await {
            Ok(raw) => {
                self.record(|s| s.bytes_recv += raw.len() as u64);
                decode_reply(&raw)
            }
            Err(e) => Err(e),
        };

        result.map_err(|e| {
            self.record(|s| s.errors += 1);
            tracing::warn!(id, method, error = %e, endpoint = %self.config.endpoint, "HTTP request failed");
            TransportError::Request {
                request: json!({ "method": method, "params": params }).to_string(),
                source: Box::new(e),
            }
        })
    }
}

#[async_trait]
impl RpcProvider for HttpProvider {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(
        &self,
        method: &str,
        params: Vec<Value>,
        cacheable: bool,
    ) -> Result<Value, TransportError> {
        self.inner.record(|s| s.requests += 1);
        match &self.inner.cache {
            Some(cache) if cacheable => {
                let key = CallCache::key(method, &params);
                let inner = self.inner.clone();
                let method = method.to_string();
                let (outcome, hit) = cache.get_or_start(&key, move || {
                    async move { inner.post_call(&method, params).await }.boxed()
                });
                if hit {
                    tracing::debug!(key = %key, "attached to cached call");
                    self.inner.record(|s| s.cached += 1);
                }
                cache.settle(&key, outcome).await
            }
            _ => self.inner.post_call(method, params).await,
        }
    }

    fn on(
        &self,
        event: ProviderEvent,
        handler: EventHandler<ProviderEventData>,
    ) -> ProviderListener {
        attach_handler(&self.inner.events, event, handler, true)
    }

    fn stats(&self) -> ProviderStats {
        let active = ActiveStats {
            requests: self.inner.in_flight.load(Ordering::Relaxed),
            subscriptions: 0,
        };
        self.inner.stats.lock().unwrap().snapshot(active)
    }

    fn has_subscriptions(&self) -> bool {
        false
    }

    fn is_clonable(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn endpoint(&self) -> String {
        self.inner.config.endpoint.clone()
    }
}
