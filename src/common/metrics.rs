//! Client metrics
//!
//! Atomic counters for the replication paths, rendered in Prometheus text
//! format. Dropped aggregate-stream members and late hedge responses are
//! counted here so the best-effort paths stay observable.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value (milliseconds)
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    /// Cumulative (upper bound, count) pairs, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

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

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Subtract, stopping at zero.
    pub fn sub(&self, n: u64) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(n))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters shared by the tracker, pool and coordinator of one client
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub requests_sent: Counter,
    pub responses_resolved: Counter,
    /// Responses that arrived for an unknown, expired or superseded id
    pub responses_dropped: Counter,
    pub requests_timed_out: Counter,
    pub requests_superseded: Counter,
    pub hedges_sent: Counter,
    pub replica_failures: Counter,
    pub aggregate_members_dropped: Counter,
    pub append_flushes: Counter,
    pub append_buffered_bytes: Gauge,
    pub pending_requests: Gauge,
    pub response_latency: Histogram,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("requests_sent_total", "Requests written to a node connection", &self.requests_sent),
            ("responses_resolved_total", "Responses matched to a pending request", &self.responses_resolved),
            ("responses_dropped_total", "Late or unknown responses discarded", &self.responses_dropped),
            ("requests_timed_out_total", "Requests that hit their deadline", &self.requests_timed_out),
            ("requests_superseded_total", "Requests discarded after a hedge sibling won", &self.requests_superseded),
            ("hedges_sent_total", "Backup requests sent after the hedge delay", &self.hedges_sent),
            ("replica_failures_total", "Per-replica attempts that produced no result", &self.replica_failures),
            ("aggregate_members_dropped_total", "Per-node streams dropped from aggregated streams", &self.aggregate_members_dropped),
            ("append_flushes_total", "Buffered append flushes", &self.append_flushes),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP ringkv_{} {}", name, help);
            let _ = writeln!(out, "# TYPE ringkv_{} counter", name);
            let _ = writeln!(out, "ringkv_{} {}", name, counter.get());
        }

        let gauges = [
            ("append_buffered_bytes", "Bytes waiting in append buffers", &self.append_buffered_bytes),
            ("pending_requests", "Requests awaiting a response", &self.pending_requests),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP ringkv_{} {}", name, help);
            let _ = writeln!(out, "# TYPE ringkv_{} gauge", name);
            let _ = writeln!(out, "ringkv_{} {}", name, gauge.get());
        }

        out.push_str("# HELP ringkv_response_latency_ms Replica response latency\n");
        out.push_str("# TYPE ringkv_response_latency_ms histogram\n");
        for (le, count) in self.response_latency.get_buckets() {
            let le = if le.is_infinite() {
                "+Inf".to_string()
            } else {
                le.to_string()
            };
            let _ = writeln!(out, "ringkv_response_latency_ms_bucket{{le=\"{}\"}} {}", le, count);
        }
        let _ = writeln!(out, "ringkv_response_latency_ms_sum {}", self.response_latency.sum());
        let _ = writeln!(out, "ringkv_response_latency_ms_count {}", self.response_latency.count());

        out
    }
}
