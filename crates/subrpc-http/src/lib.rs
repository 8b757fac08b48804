//! subrpc-http — stateless HTTP JSON-RPC provider.
//!
//! # Features
//! - One POST per call, no connection state
//! - Concurrent identical cacheable calls share a single POST
//! - Failures annotated with the method and params that caused them

pub mod config;
pub mod exchange;
pub mod provider;

pub use config::HttpProviderConfig;
pub use exchange::{HttpExchange, ReqwestExchange};
pub use provider::HttpProvider;
