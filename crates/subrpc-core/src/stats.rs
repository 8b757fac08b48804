//! Provider statistics.

use serde::{Deserialize, Serialize};

/// Counters for one connection (or cumulative across connections).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    /// Calls answered from the call cache.
    pub cached: u64,
    pub errors: u64,
    pub requests: u64,
    pub subscriptions: u64,
    pub timeout: u64,
}

/// Work currently in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStats {
    pub requests: u64,
    pub subscriptions: u64,
}

/// Snapshot returned by `RpcProvider::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub active: ActiveStats,
    pub total: EndpointStats,
}

/// Keeps per-connection and cumulative counters in step.
#[derive(Debug, Clone, Default)]
pub struct StatsRecorder {
    endpoint: EndpointStats,
    total: EndpointStats,
}

impl StatsRecorder {
    /// Apply `update` to both the current-connection and the total counters.
    pub fn record(&mut self, update: impl Fn(&mut EndpointStats)) {
        update(&mut self.endpoint);
        update(&mut self.total);
    }

    /// Zero the current-connection counters; totals are kept.
    pub fn reset_endpoint(&mut self) {
        self.endpoint = EndpointStats::default();
    }

    pub fn endpoint(&self) -> EndpointStats {
        self.endpoint
    }

    pub fn total(&self) -> EndpointStats {
        self.total
    }

    pub fn snapshot(&self, active: ActiveStats) -> ProviderStats {
        ProviderStats {
            active,
            total: self.total,
        }
    }
}
