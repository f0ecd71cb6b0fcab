//! Server probe counters and the dispatch latency histogram.
//!
//! Exposition endpoints live elsewhere; this module only maintains the
//! counters and hands out snapshots under the stable metric names.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-shard event counters. Counters are always maintained; the
/// `disable_metrics` option only suppresses the snapshot surface.
#[derive(Default)]
pub struct Probe {
    requests_completed: AtomicU64,
    bytes_received: AtomicU64,
    header_corrupted: AtomicU64,
    method_not_found: AtomicU64,
    memory_waits: AtomicU64,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn header_corrupted(&self) {
        self.header_corrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn method_not_found(&self) {
        self.method_not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn waiting_for_available_memory(&self) {
        self.memory_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        ProbeSnapshot {
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            header_corrupted: self.header_corrupted.load(Ordering::Relaxed),
            method_not_found: self.method_not_found.load(Ordering::Relaxed),
            memory_waits: self.memory_waits.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.snapshot();
        write!(
            f,
            "requests_completed: {}, bytes_received: {}, header_corrupted: {}, \
             method_not_found: {}, memory_waits: {}",
            s.requests_completed,
            s.bytes_received,
            s.header_corrupted,
            s.method_not_found,
            s.memory_waits
        )
    }
}

/// Point-in-time copy of the probe counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSnapshot {
    pub requests_completed: u64,
    pub bytes_received: u64,
    pub header_corrupted: u64,
    pub method_not_found: u64,
    pub memory_waits: u64,
}

const LATENCY_BUCKETS: usize = 26;

/// Log-form latency histogram: bucket `i` counts samples at or under
/// `2^i` microseconds, with the last bucket absorbing the tail.
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let bucket = (64 - micros.leading_zeros() as usize).min(LATENCY_BUCKETS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_micros: self.sum_micros.load(Ordering::Relaxed),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a [`LatencyHistogram`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    /// Bucket `i` counts samples at or under `2^i` microseconds.
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum_micros: u64,
}

/// Metrics snapshot for one server instance. Names are stable.
#[derive(Debug, Clone)]
pub struct ServerMetrics {
    /// Number of registered services.
    pub rpc_services: usize,
    /// Configured memory cap in bytes.
    pub rpc_max_service_mem: usize,
    /// Bytes currently reserved for request processing.
    pub rpc_consumed_mem: usize,
    /// Latency from handler dispatch to reply write.
    pub rpc_dispatch_handler_latency: HistogramSnapshot,
    /// Reservations currently suspended on the memory pool.
    pub memory_waiters: usize,
    pub probe: ProbeSnapshot,
}
