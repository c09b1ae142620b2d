//! Metric events and per-endpoint latency statistics.
//!
//! Virtual users push [`MetricRecord`]s through a cheap cloneable
//! [`MetricSink`]; the worker's aggregator drains the channel and folds
//! records into a [`StatsRegistry`]. Registries are mergeable so the
//! master can fold worker-reported stats into its own store; medians and
//! p90s are only ever computed there, from the merged samples.

use std::{collections::BTreeMap, time::Instant};

use tokio::sync::mpsc;

use crate::prelude::*;

pub const TIME_TO_FIRST_OUTPUT_TOKEN: &str = "Time_to_first_output_token";
pub const TIME_TO_FIRST_REASONING_TOKEN: &str = "Time_to_first_reasoning_token";
pub const TIME_TO_REASONING_COMPLETION: &str = "Time_to_reasoning_completion";
pub const TIME_TO_OUTPUT_COMPLETION: &str = "Time_to_output_completion";
pub const TOTAL_TIME: &str = "Total_time";

/// One observable timing, success, or failure.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MetricEvent {
    pub name: String,
    pub response_time_ms: f64,
    pub response_length: u64,
    pub success: bool,
}

/// What flows from virtual users to the worker aggregator.
#[derive(Clone, Debug)]
pub enum MetricRecord {
    Event(MetricEvent),
    /// Token tallies for one completed request.
    Tokens {
        completion_tokens: u64,
        total_tokens: u64,
    },
}

/// Cloneable handle through which virtual users emit metrics.
#[derive(Clone, Debug)]
pub struct MetricSink {
    tx: mpsc::UnboundedSender<MetricRecord>,
}

impl MetricSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MetricRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MetricSink { tx }, rx)
    }

    pub fn record_success(&self, name: &str, response_time_ms: f64, response_length: u64) {
        self.push(MetricEvent {
            name: name.to_owned(),
            response_time_ms,
            response_length,
            success: true,
        });
    }

    pub fn record_failure(
        &self,
        name: &str,
        response_time_ms: f64,
        response_length: u64,
        cause: &str,
    ) {
        debug!(name, cause, "recording request failure");
        self.push(MetricEvent {
            name: name.to_owned(),
            response_time_ms,
            response_length,
            success: false,
        });
    }

    /// Push the token tallies of one completed request.
    pub fn record_tokens(&self, completion_tokens: u64, total_tokens: u64) {
        // The receiver only disappears at shutdown; losing a tail sample
        // then is acceptable.
        let _ = self.tx.send(MetricRecord::Tokens {
            completion_tokens,
            total_tokens,
        });
    }

    fn push(&self, event: MetricEvent) {
        let _ = self.tx.send(MetricRecord::Event(event));
    }
}

/// Latency distribution for one metric name.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct EndpointStats {
    pub num_requests: u64,
    pub num_failures: u64,
    pub total_response_time: f64,
    pub min_response_time: Option<f64>,
    pub max_response_time: f64,
    pub total_content_length: u64,
    /// Every observed response time; quantiles are exact.
    pub response_times: Vec<f64>,
}

impl EndpointStats {
    pub fn record(&mut self, response_time_ms: f64, response_length: u64, success: bool) {
        self.num_requests += 1;
        if !success {
            self.num_failures += 1;
        }
        self.total_response_time += response_time_ms;
        self.min_response_time = Some(match self.min_response_time {
            Some(min) => min.min(response_time_ms),
            None => response_time_ms,
        });
        self.max_response_time = self.max_response_time.max(response_time_ms);
        self.total_content_length += response_length;
        self.response_times.push(response_time_ms);
    }

    /// Fold another distribution into this one. Counts, sums, min and max
    /// merge directly; samples concatenate so quantiles stay exact.
    pub fn merge(&mut self, other: &EndpointStats) {
        self.num_requests += other.num_requests;
        self.num_failures += other.num_failures;
        self.total_response_time += other.total_response_time;
        self.min_response_time = match (self.min_response_time, other.min_response_time)
        {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_response_time = self.max_response_time.max(other.max_response_time);
        self.total_content_length += other.total_content_length;
        self.response_times
            .extend_from_slice(&other.response_times);
    }

    pub fn avg_response_time(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.total_response_time / self.num_requests as f64
        }
    }

    pub fn avg_content_length(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.total_content_length as f64 / self.num_requests as f64
        }
    }

    pub fn median_response_time(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p90_response_time(&self) -> f64 {
        self.percentile(0.9)
    }

    /// Exact percentile over observed samples; 0 when nothing was observed.
    pub fn percentile(&self, fraction: f64) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        let mut sorted = self.response_times.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("response times are finite"));
        let rank = ((sorted.len() as f64 * fraction).ceil() as usize).max(1);
        sorted[rank.min(sorted.len()) - 1]
    }
}

/// Stats entries keyed by metric name, as shipped inside worker snapshots.
pub type WireStats = BTreeMap<String, EndpointStats>;

/// The per-process store of endpoint statistics.
#[derive(Debug)]
pub struct StatsRegistry {
    start: Instant,
    entries: BTreeMap<String, EndpointStats>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        StatsRegistry {
            start: Instant::now(),
            entries: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, event: &MetricEvent) {
        self.entries.entry(event.name.clone()).or_default().record(
            event.response_time_ms,
            event.response_length,
            event.success,
        );
    }

    /// Fold worker-reported stats into this registry.
    pub fn merge_wire(&mut self, wire: &WireStats) {
        for (name, stats) in wire {
            self.entries.entry(name.clone()).or_default().merge(stats);
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, EndpointStats> {
        &self.entries
    }

    pub fn to_wire(&self) -> WireStats {
        self.entries.clone()
    }

    /// Seconds since this registry was created.
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Sum of failures across all endpoints.
    pub fn total_failures(&self) -> u64 {
        self.entries.values().map(|stats| stats.num_failures).sum()
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_updates_distribution() {
        let mut stats = EndpointStats::default();
        stats.record(100.0, 10, true);
        stats.record(300.0, 30, false);
        assert_eq!(stats.num_requests, 2);
        assert_eq!(stats.num_failures, 1);
        assert_eq!(stats.min_response_time, Some(100.0));
        assert_eq!(stats.max_response_time, 300.0);
        assert_eq!(stats.avg_response_time(), 200.0);
        assert_eq!(stats.avg_content_length(), 20.0);
    }

    #[test]
    fn percentiles_are_exact_over_samples() {
        let mut stats = EndpointStats::default();
        for ms in 1..=10 {
            stats.record(ms as f64, 0, true);
        }
        assert_eq!(stats.median_response_time(), 5.0);
        assert_eq!(stats.p90_response_time(), 9.0);
    }

    #[test]
    fn empty_stats_report_zero() {
        let stats = EndpointStats::default();
        assert_eq!(stats.avg_response_time(), 0.0);
        assert_eq!(stats.median_response_time(), 0.0);
        assert_eq!(stats.p90_response_time(), 0.0);
    }

    #[test]
    fn merge_is_commutative_for_counts_and_extremes() {
        let mut left = EndpointStats::default();
        left.record(10.0, 1, true);
        left.record(20.0, 2, false);
        let mut right = EndpointStats::default();
        right.record(5.0, 3, true);

        let mut a = left.clone();
        a.merge(&right);
        let mut b = right.clone();
        b.merge(&left);

        assert_eq!(a.num_requests, b.num_requests);
        assert_eq!(a.num_failures, b.num_failures);
        assert_eq!(a.min_response_time, b.min_response_time);
        assert_eq!(a.max_response_time, b.max_response_time);
        assert_eq!(a.median_response_time(), b.median_response_time());
    }

    #[test]
    fn registry_applies_events_and_counts_failures() {
        let mut registry = StatsRegistry::new();
        registry.apply(&MetricEvent {
            name: "chat_completions".to_owned(),
            response_time_ms: 12.0,
            response_length: 3,
            success: true,
        });
        registry.apply(&MetricEvent {
            name: "chat_completions".to_owned(),
            response_time_ms: 15.0,
            response_length: 0,
            success: false,
        });
        assert_eq!(registry.entries()["chat_completions"].num_requests, 2);
        assert_eq!(registry.total_failures(), 1);
    }

    #[test]
    fn sink_delivers_records() {
        let (sink, mut rx) = MetricSink::channel();
        sink.record_success("x", 1.0, 2);
        sink.record_failure("x", 3.0, 0, "boom");
        sink.record_tokens(7, 9);
        let mut events = 0;
        let mut tokens = 0;
        while let Ok(record) = rx.try_recv() {
            match record {
                MetricRecord::Event(_) => events += 1,
                MetricRecord::Tokens { .. } => tokens += 1,
            }
        }
        assert_eq!(events, 2);
        assert_eq!(tokens, 1);
    }
}
