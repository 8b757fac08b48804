//! Call cache: shares one in-flight (or resolved) outcome between identical
//! cacheable calls.
//!
//! Entries are keyed by `method::params-json` and hold a [`Shared`] future, so a
//! second caller that arrives while the first request is still on the wire
//! attaches to it instead of issuing a duplicate. Outcomes that resolve to an
//! error are invalidated so the next identical call goes back to the node.

use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use crate::cache::LruCache;
use crate::error::TransportError;

/// A clonable handle to one call's outcome.
pub type SharedOutcome = Shared<BoxFuture<'static, Result<Value, TransportError>>>;

/// Bounded, expiring map from call key to shared outcome.
pub struct CallCache {
    entries: Mutex<LruCache<String, SharedOutcome>>,
}

impl CallCache {
    /// Build a cache, or `None` when `capacity` is 0 (caching disabled).
    pub fn with_capacity(
        capacity: usize,
        ttl: Option<Duration>,
    ) -> Result<Option<Self>, TransportError> {
        let entries = LruCache::new(capacity, ttl)?;
        if capacity == 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            entries: Mutex::new(entries),
        }))
    }

    /// Cache key for a call.
    pub fn key(method: &str, params: &[Value]) -> String {
        format!("{method}::{}", Value::Array(params.to_vec()))
    }

    /// Return the cached outcome for `key`, or start one with `start` and
    /// cache it. The flag is `true` on a hit.
    pub fn get_or_start<F>(&self, key: &str, start: F) -> (SharedOutcome, bool)
    where
        F: FnOnce() -> BoxFuture<'static, Result<Value, TransportError>>,
    {
        let mut entries = self.entries.lock().unwrap();
        if let Some(outcome) = entries.get(key) {
            return (outcome, true);
        }
        let outcome = start().shared();
        entries.set(key.to_string(), outcome.clone());
        (outcome, false)
    }

    /// Await the outcome for `key`, starting it if needed. Failed outcomes
    /// are dropped from the cache.
    pub async fn resolve<F>(&self, key: &str, start: F) -> (Result<Value, TransportError>, bool)
    where
        F: FnOnce() -> BoxFuture<'static, Result<Value, TransportError>>,
    {
        let (outcome, hit) = self.get_or_start(key, start);
        (self.settle(key, outcome).await, hit)
    }

    /// Await an outcome obtained from [`get_or_start`](Self::get_or_start),
    /// dropping `key` from the cache if it failed. A newer outcome cached
    /// under the same key in the meantime is left alone.
    pub async fn settle(
        &self,
        key: &str,
        outcome: SharedOutcome,
    ) -> Result<Value, TransportError> {
        let result = outcome.clone().await;
        if let Err(e) = &result {
            let removed = self
                .entries
                .lock()
                .unwrap()
                .remove_if(key, |cached| cached.ptr_eq(&outcome));
            if removed.is_some() {
                tracing::debug!(key, error = %e, "dropping failed call from cache");
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CallCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCache").field("len", &self.len()).finish()
    }
}
