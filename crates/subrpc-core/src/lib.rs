//! subrpc-core — foundation traits and types for subrpc.
//!
//! # Overview
//!
//! subrpc is a transport layer for talking JSON-RPC 2.0 to a Substrate-style
//! blockchain node over flaky networks. The core crate defines:
//!
//! - [`RpcProvider`] — the async contract every transport implements
//! - [`RpcCodec`] — correlated request encoding and inbound validation
//! - [`LruCache`] / [`CallCache`] — bounded expiring cache and call de-duplication
//! - [`EventEmitter`] — typed lifecycle event register
//! - [`TransportError`] — structured error type
//! - [`policy`] module — reconnect backoff

pub mod cache;
pub mod codec;
pub mod dedup;
pub mod error;
pub mod events;
pub mod policy;
pub mod provider;
pub mod request;
pub mod stats;

pub use cache::LruCache;
pub use codec::{Inbound, RpcCodec};
pub use dedup::{CallCache, SharedOutcome};
pub use error::TransportError;
pub use events::{EventEmitter, EventHandler, ProviderEmitter, ProviderEvent, ProviderListener};
pub use provider::{HealthStatus, RpcProvider, SubscriptionCallback, SubscriptionId};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId, RpcParam};
pub use stats::{ActiveStats, EndpointStats, ProviderStats};
