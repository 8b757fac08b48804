//! WebSocket subscription bookkeeping.
//!
//! Live subscriptions are keyed by `kind::id` and only valid for the current
//! connection. Durable entries remember how each subscription was created so
//! it can be issued again after a reconnect, when the node hands out new ids.
//! Notifications that arrive before the subscribe reply are parked under the
//! same key until the reply registers the callback.

use std::collections::HashMap;

use serde_json::Value;

use subrpc_core::{SubscriptionCallback, TransportError};

/// Notifications parked per key before the subscribe reply arrives.
pub const MAX_WAITING_PER_KEY: usize = 256;

/// Distinct keys that may hold parked notifications.
pub const MAX_WAITING_KEYS: usize = 1_024;

type Outcome = Result<Value, TransportError>;

/// How a subscription was created, kept across reconnects.
#[derive(Clone)]
pub struct ResubscribeEntry {
    pub kind: String,
    pub method: String,
    pub params: Vec<Value>,
    pub callback: SubscriptionCallback,
}

impl std::fmt::Debug for ResubscribeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResubscribeEntry")
            .field("kind", &self.kind)
            .field("method", &self.method)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Result of registering an acknowledged subscription.
pub enum Activation {
    /// Registered. Carries the notifications parked for the key, in arrival
    /// order.
    Live(Vec<Outcome>),
    /// The caller unsubscribed while the resubscription was in flight.
    /// Carries the method that cancels the new id on the node, if known.
    Cancelled(Option<String>),
}

/// Live and durable subscription tables of one provider.
#[derive(Default)]
pub struct SubscriptionTable {
    live: HashMap<String, SubscriptionCallback>,
    durable: HashMap<String, ResubscribeEntry>,
    waiting: HashMap<String, Vec<Outcome>>,
    /// Unsubscribe methods for re-issued subscriptions cancelled before
    /// their reply, keyed by the replaced key.
    cancelled: HashMap<String, String>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the subscription acknowledged under `key`.
    ///
    /// `replaces` is the key of the durable entry a resubscription stands in
    /// for. If that entry is gone the caller unsubscribed meanwhile: nothing
    /// is registered and notifications parked for `key` are discarded.
    pub fn activate(
        &mut self,
        key: String,
        entry: ResubscribeEntry,
        replaces: Option<&str>,
    ) -> Activation {
        if let Some(old) = replaces {
            if self.durable.remove(old).is_none() {
                self.waiting.remove(&key);
                return Activation::Cancelled(self.cancelled.remove(old));
            }
        }
        self.live.insert(key.clone(), entry.callback.clone());
        let parked = self.waiting.remove(&key).unwrap_or_default();
        self.durable.insert(key, entry);
        Activation::Live(parked)
    }

    /// Resolve the callback for a notification, parking it when no live
    /// subscription has that key yet.
    pub fn route(&mut self, key: &str, outcome: Outcome) -> Option<(SubscriptionCallback, Outcome)> {
        if let Some(callback) = self.live.get(key) {
            return Some((callback.clone(), outcome));
        }
        if !self.waiting.contains_key(key) && self.waiting.len() >= MAX_WAITING_KEYS {
            tracing::debug!(key, "dropping notification, too many unacknowledged keys");
            return None;
        }
        let parked = self.waiting.entry(key.to_string()).or_default();
        if parked.len() < MAX_WAITING_PER_KEY {
            tracing::debug!(key, "parking notification until subscribe reply");
            parked.push(outcome);
        } else {
            tracing::debug!(key, "dropping notification, parking buffer full");
        }
        None
    }

    /// Forget `key` entirely. Returns `true` if it was live or waiting to be
    /// issued again.
    pub fn remove(&mut self, key: &str) -> bool {
        self.waiting.remove(key);
        let durable = self.durable.remove(key).is_some();
        self.live.remove(key).is_some() || durable
    }

    /// Remember how to cancel the re-issued subscription replacing `key`
    /// once its reply arrives.
    pub fn cancel_reissue(&mut self, key: &str, unsubscribe_method: &str) {
        self.cancelled
            .insert(key.to_string(), unsubscribe_method.to_string());
    }

    /// Drop connection-scoped state; durable entries are kept.
    pub fn drop_live(&mut self) {
        self.live.clear();
        self.waiting.clear();
        self.cancelled.clear();
    }

    /// Durable entries to issue again, paired with their current key.
    pub fn resubscribe_snapshot(&self) -> Vec<(String, ResubscribeEntry)> {
        self.durable
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Drop a durable entry without touching live state.
    pub fn forget(&mut self, key: &str) {
        self.durable.remove(key);
    }

    pub fn is_live(&self, key: &str) -> bool {
        self.live.contains_key(key)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn durable_count(&self) -> usize {
        self.durable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty() && self.durable.is_empty()
    }
}
