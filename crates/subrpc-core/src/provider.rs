//! The `RpcProvider` trait — the contract every transport implements.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::events::{
    EventHandler, ProviderEmitter, ProviderEvent, ProviderEventData, ProviderListener,
};
use crate::stats::ProviderStats;

/// Provider health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connection is open (or the transport needs none).
    Healthy,
    /// Connection was lost and a reconnect is in progress.
    Degraded,
    /// Not connected and not trying to.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A server-assigned subscription id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionId {
    Number(u64),
    String(String),
}

impl SubscriptionId {
    /// Read an id from a subscribe result or `params.subscription`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => n.as_u64().map(Self::Number),
            _ => None,
        }
    }

    /// The id as sent back to the node on unsubscribe.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<u64> for SubscriptionId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// Composite key `kind::id` namespacing server ids by notification kind.
pub fn subscription_key(kind: &str, id: &SubscriptionId) -> String {
    format!("{kind}::{id}")
}

/// Receives every notification (or notification error) of a subscription.
pub type SubscriptionCallback = Arc<dyn Fn(Result<Value, TransportError>) + Send + Sync>;

/// Register a lifecycle handler, firing `connected` immediately when the
/// provider is already connected so late registrations see the state.
pub fn attach_handler(
    emitter: &ProviderEmitter,
    event: ProviderEvent,
    handler: EventHandler<ProviderEventData>,
    connected: bool,
) -> ProviderListener {
    if event == ProviderEvent::Connected && connected {
        handler(&None);
    }
    emitter.on_shared(event, handler)
}

/// The central async trait every RPC provider must implement.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn RpcProvider>`.
#[async_trait]
pub trait RpcProvider: Send + Sync + 'static {
    /// Open the underlying connection. Fails if already connecting/connected.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the underlying connection. A no-op when not connected.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send one call and wait for its result.
    ///
    /// `cacheable` lets identical calls share one outcome via the call cache.
    async fn send(
        &self,
        method: &str,
        params: Vec<Value>,
        cacheable: bool,
    ) -> Result<Value, TransportError>;

    /// Start a subscription; notifications for it are passed to `callback`.
    async fn subscribe(
        &self,
        kind: &str,
        method: &str,
        _params: Vec<Value>,
        _callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, TransportError> {
        Err(TransportError::Unsupported(format!(
            "{method} ({kind}): this transport has no subscriptions"
        )))
    }

    /// Cancel a subscription. Resolves to the node's answer, or `false` when
    /// no such subscription is active.
    async fn unsubscribe(
        &self,
        kind: &str,
        method: &str,
        _id: &SubscriptionId,
    ) -> Result<bool, TransportError> {
        Err(TransportError::Unsupported(format!(
            "{method} ({kind}): this transport has no subscriptions"
        )))
    }

    /// Register a lifecycle handler.
    fn on(
        &self,
        event: ProviderEvent,
        handler: EventHandler<ProviderEventData>,
    ) -> ProviderListener;

    fn stats(&self) -> ProviderStats;

    fn has_subscriptions(&self) -> bool;

    fn is_clonable(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Return the current health status of this provider.
    fn health(&self) -> HealthStatus {
        if self.is_connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// The endpoint currently in use.
    fn endpoint(&self) -> String;

    /// Convenience: call a method and deserialize the result.
    async fn call<T>(&self, method: &str, params: Vec<Value>) -> Result<T, TransportError>
    where
        Self: Sized,
        T: DeserializeOwned + Send,
    {
        let result = self.send(method, params, false).await?;
        serde_json::from_value(result).map_err(TransportError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscription_id_forms() {
        assert_eq!(
            SubscriptionId::from_value(&json!("0xab")),
            Some(SubscriptionId::String("0xab".into()))
        );
        assert_eq!(SubscriptionId::from_value(&json!(12)), Some(SubscriptionId::Number(12)));
        assert_eq!(SubscriptionId::from_value(&json!(true)), None);
        assert_eq!(SubscriptionId::Number(12).to_value(), json!(12));
        assert_eq!(
            subscription_key("chain_newHead", &SubscriptionId::from("xyz")),
            "chain_newHead::xyz"
        );
    }

    #[test]
    fn connected_handler_fires_when_already_connected() {
        let emitter = ProviderEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        attach_handler(
            &emitter,
            ProviderEvent::Connected,
            Arc::new(move |_: &ProviderEventData| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        attach_handler(
            &emitter,
            ProviderEvent::Connected,
            Arc::new(move |_: &ProviderEventData| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        emitter.emit(ProviderEvent::Connected, &None);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
