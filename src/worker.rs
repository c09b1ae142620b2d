//! Per-worker-process metric accumulation.
//!
//! Each worker owns one aggregator fed by the metric channel its virtual
//! users write into. On demand the aggregator produces a snapshot: the
//! cumulative counters plus the raw endpoint distributions, stamped with
//! a monotonic request id so the master can deduplicate deliveries.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::{
    metrics::{MetricRecord, MetricSink, StatsRegistry, WireStats},
    prelude::*,
};

/// Seconds since the Unix epoch, as the wire format carries timestamps.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// The canonical worker identity. PIDs can be reused across the life of a
/// test, so the start timestamp is folded in.
pub fn worker_identity(pid: u32) -> String {
    let start_unix_ms = (unix_now() * 1000.0) as u64;
    format!("{pid}_{start_unix_ms}")
}

/// One worker's snapshot, as delivered to the master.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub pid: u32,
    /// Monotonic per-worker delivery id; the master's deduplication key.
    pub request_id: String,
    pub timestamp: f64,
    pub request_count: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Raw endpoint distributions for the master to fold into its own
    /// stats store.
    pub stats: WireStats,
}

/// Accumulates everything the worker's virtual users emit.
#[derive(Debug)]
pub struct WorkerAggregator {
    rx: mpsc::UnboundedReceiver<MetricRecord>,
    stats: StatsRegistry,
    request_count: u64,
    completion_tokens: u64,
    total_tokens: u64,
    worker_id: String,
    pid: u32,
    snapshot_seq: u64,
}

impl WorkerAggregator {
    /// Create an aggregator plus the sink virtual users emit into.
    pub fn new() -> (Self, MetricSink) {
        let (sink, rx) = MetricSink::channel();
        let pid = std::process::id();
        let aggregator = WorkerAggregator {
            rx,
            stats: StatsRegistry::new(),
            request_count: 0,
            completion_tokens: 0,
            total_tokens: 0,
            worker_id: worker_identity(pid),
            pid,
            snapshot_seq: 0,
        };
        (aggregator, sink)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Pull everything currently queued into the counters.
    pub fn drain(&mut self) {
        while let Ok(record) = self.rx.try_recv() {
            match record {
                MetricRecord::Event(event) => self.stats.apply(&event),
                MetricRecord::Tokens {
                    completion_tokens,
                    total_tokens,
                } => {
                    self.request_count += 1;
                    self.completion_tokens += completion_tokens;
                    self.total_tokens += total_tokens;
                }
            }
        }
    }

    /// Drain pending records and produce a snapshot of the cumulative
    /// counters.
    pub fn snapshot(&mut self) -> WorkerSnapshot {
        self.drain();
        self.snapshot_seq += 1;
        WorkerSnapshot {
            worker_id: self.worker_id.clone(),
            pid: self.pid,
            request_id: format!("{}_{}", self.worker_id, self.snapshot_seq),
            timestamp: unix_now(),
            request_count: self.request_count,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            stats: self.stats.to_wire(),
        }
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_counts_completed_requests() {
        let (mut aggregator, sink) = WorkerAggregator::new();
        sink.record_success("chat_completions", 12.0, 3);
        sink.record_tokens(10, 14);
        sink.record_tokens(20, 26);

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.completion_tokens, 30);
        assert_eq!(snapshot.total_tokens, 40);
        assert_eq!(snapshot.stats["chat_completions"].num_requests, 1);
    }

    #[test]
    fn request_ids_are_monotonic_and_unique() {
        let (mut aggregator, _sink) = WorkerAggregator::new();
        let first = aggregator.snapshot().request_id;
        let second = aggregator.snapshot().request_id;
        assert_ne!(first, second);
        assert!(first.starts_with(aggregator.worker_id()));
        assert!(second.ends_with("_2"));
    }

    #[test]
    fn counters_are_cumulative_across_snapshots() {
        let (mut aggregator, sink) = WorkerAggregator::new();
        sink.record_tokens(5, 7);
        let first = aggregator.snapshot();
        sink.record_tokens(5, 7);
        let second = aggregator.snapshot();
        assert_eq!(first.request_count, 1);
        assert_eq!(second.request_count, 2);
        assert_eq!(second.total_tokens, 14);
    }

    #[test]
    fn worker_identity_includes_pid() {
        let id = worker_identity(4242);
        assert!(id.starts_with("4242_"));
    }
}
