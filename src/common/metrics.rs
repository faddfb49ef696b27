//! Metrics collection
//!
//! Counters and gauges for the submission pipeline, exported in Prometheus
//! text format. Everything here is a count or a timestamp; response content
//! never enters the registry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for monotonically increasing values
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Registry of the subsystem's metrics
#[derive(Debug, Default)]
pub struct Metrics {
    /// Responses accepted into the local queue
    pub queued_total: Counter,
    /// Responses forwarded to the leader
    pub transferred_total: Counter,
    /// Failed outbound transfer attempts
    pub transfer_failures: Counter,
    /// Responses received from followers
    pub received_total: Counter,
    /// Flush cycles executed
    pub flush_cycles: Counter,
    /// Responses durably persisted
    pub flushed_total: Counter,
    /// Leadership transitions observed locally
    pub leadership_changes: Counter,
    /// Current queue depth
    pub queue_depth: Gauge,
}

impl Metrics {
    /// Render the registry in Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let pairs = [
            ("veilq_queued_total", self.queued_total.get()),
            ("veilq_transferred_total", self.transferred_total.get()),
            ("veilq_transfer_failures_total", self.transfer_failures.get()),
            ("veilq_received_total", self.received_total.get()),
            ("veilq_flush_cycles_total", self.flush_cycles.get()),
            ("veilq_flushed_total", self.flushed_total.get()),
            (
                "veilq_leadership_changes_total",
                self.leadership_changes.get(),
            ),
            ("veilq_queue_depth", self.queue_depth.get()),
        ];
        for (name, value) in pairs {
            out.push_str(&format!("{} {}\n", name, value));
        }
        out
    }
}
