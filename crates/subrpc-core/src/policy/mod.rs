//! Connection policies.
//!
//! Only the reconnect loop retries on its own; individual calls are never
//! retried by a provider.

pub mod backoff;

pub use backoff::{BackoffConfig, BackoffPolicy};
