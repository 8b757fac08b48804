//! subrpc-ws — WebSocket JSON-RPC provider with auto-reconnect.
//!
//! # Features
//! - Endpoint rotation on every (re)connect
//! - Auto-reconnect with a fixed or capped exponential delay
//! - Subscriptions re-issued after reconnect (except extrinsic watches)
//! - Notifications arriving before the subscribe reply are replayed in order
//! - Stale requests failed by a periodic sweep
//! - Request multiplexing and call de-duplication over a single connection

pub mod config;
pub mod connector;
pub mod provider;
pub mod subscriptions;

pub use config::WsProviderConfig;
pub use connector::{Connection, Connector, TungsteniteConnector};
pub use provider::{ConnectionState, WsProvider};
pub use subscriptions::{Activation, ResubscribeEntry, SubscriptionTable};
