//! Message codec: correlated request encoding and inbound validation.
//!
//! Every outbound request gets the next id from a per-codec counter, so ids
//! strictly increase for the lifetime of one codec instance. Inbound messages
//! are split into replies (routed by id) and subscription notifications
//! (routed by `method` + `params.subscription`). Validation failures that can
//! still be correlated are reported inside [`Inbound`] so only the affected
//! caller sees them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::{TransportError, UNKNOWN};
use crate::provider::SubscriptionId;
use crate::request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};

/// Historical notification names mapped to their current spelling.
const ALIASES: &[(&str, &str)] = &[
    ("chain_finalisedHead", "chain_finalizedHead"),
    ("chain_subscribeFinalisedHeads", "chain_subscribeFinalizedHeads"),
    ("chain_unsubscribeFinalisedHeads", "chain_unsubscribeFinalizedHeads"),
];

/// Resolve a notification method name through the alias table.
pub fn canonical_method(method: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == method)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(method)
}

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Reply to the request with correlation id `id`.
    Reply {
        id: u64,
        outcome: Result<Value, TransportError>,
    },
    /// Notification for a live subscription.
    Notification {
        method: String,
        subscription: SubscriptionId,
        outcome: Result<Value, TransportError>,
    },
}

/// JSON-RPC 2.0 encoder/decoder with its own id counter.
#[derive(Debug)]
pub struct RpcCodec {
    next_id: AtomicU64,
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCodec {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a request with the next correlation id.
    pub fn request(&self, method: &str, params: Vec<Value>) -> JsonRpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        JsonRpcRequest::new(id, method, params)
    }

    /// Allocate the next id and serialize `{id, jsonrpc, method, params}`.
    pub fn encode(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<(u64, String), TransportError> {
        let req = self.request(method, params);
        let id = req.id.as_u64().unwrap_or_default();
        let body = serde_json::to_string(&req)?;
        Ok((id, body))
    }

    /// Decode one inbound wire message.
    ///
    /// The outer `Err` is returned only when the message cannot be attributed
    /// to any caller (unparseable JSON, no id and no method).
    pub fn decode(&self, raw: &str) -> Result<Inbound, TransportError> {
        let resp: JsonRpcResponse = serde_json::from_str(raw)
            .map_err(|e| TransportError::Protocol(format!("invalid JSON message: {e}")))?;
        classify(resp)
    }
}

/// Decode a reply and unwrap it straight into its result.
pub fn decode_reply(raw: &str) -> Result<Value, TransportError> {
    let resp: JsonRpcResponse = serde_json::from_str(raw)
        .map_err(|e| TransportError::Protocol(format!("invalid JSON message: {e}")))?;
    if resp.is_notification() {
        return Err(TransportError::Protocol(
            "expected a reply, received a subscription notification".into(),
        ));
    }
    check_version(&resp)?;
    if resp.id.is_none() {
        return Err(TransportError::Protocol("reply without id".into()));
    }
    unwrap_outcome(resp.result, resp.error)
}

fn classify(resp: JsonRpcResponse) -> Result<Inbound, TransportError> {
    let version = check_version(&resp);

    if let Some(method) = resp.method {
        let params = resp
            .params
            .as_ref()
            .and_then(Value::as_object)
            .ok_or_else(|| TransportError::Protocol("notification without params".into()))?;
        let subscription = params
            .get("subscription")
            .and_then(SubscriptionId::from_value)
            .ok_or_else(|| {
                TransportError::Protocol("notification without subscription id".into())
            })?;
        let outcome = version.and_then(|()| {
            unwrap_outcome(
                params.get("result").cloned(),
                params.get("error").filter(|e| !e.is_null()).cloned(),
            )
        });
        return Ok(Inbound::Notification {
            method: canonical_method(&method).to_string(),
            subscription,
            outcome,
        });
    }

    let id = resp
        .id
        .as_ref()
        .and_then(RpcId::as_u64)
        .ok_or_else(|| TransportError::Protocol("message has neither id nor method".into()))?;
    let outcome = version.and_then(|()| unwrap_outcome(resp.result, resp.error));
    Ok(Inbound::Reply { id, outcome })
}

fn check_version(resp: &JsonRpcResponse) -> Result<(), TransportError> {
    match resp.jsonrpc.as_deref() {
        Some("2.0") => Ok(()),
        Some(other) => Err(TransportError::Protocol(format!(
            "unsupported jsonrpc version {other:?}"
        ))),
        None => Err(TransportError::Protocol("missing jsonrpc version".into())),
    }
}

fn unwrap_outcome(result: Option<Value>, error: Option<Value>) -> Result<Value, TransportError> {
    match (result, error) {
        (Some(_), Some(_)) => Err(TransportError::Protocol(
            "message carries both result and error".into(),
        )),
        (None, None) => Err(TransportError::Protocol(
            "message carries neither result nor error".into(),
        )),
        (None, Some(err)) => Err(TransportError::Rpc(rpc_error(err))),
        (Some(value), None) => Ok(value),
    }
}

fn rpc_error(err: Value) -> JsonRpcError {
    let code = err.get("code").and_then(Value::as_i64).unwrap_or(UNKNOWN);
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| err.as_str())
        .unwrap_or("Unknown error")
        .to_string();
    let data = err.get("data").filter(|d| !d.is_null()).cloned();
    JsonRpcError {
        code,
        message,
        data,
    }
}
