//! Run snapshots: the hand-off artifact between a finished generator run
//! and result persistence.
//!
//! The master writes exactly one snapshot per run to
//! `<tmpdir>/locust_result/<task_id>/result.json`; the engine reads it
//! exactly once and removes the directory. The JSON keys are a wire
//! contract shared with the result tables, so the serde names here are
//! load-bearing.

use chrono::Local;

use crate::{
    coordinator::AggregateTotals,
    metrics::StatsRegistry,
    prelude::*,
};

/// Derived per-run aggregates.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CustomMetrics {
    pub reqs_num: u64,
    pub req_throughput: f64,
    pub completion_tps: f64,
    pub total_tps: f64,
    pub avg_total_tokens_per_req: f64,
    pub avg_completion_tokens_per_req: f64,
}

impl CustomMetrics {
    /// Compute throughput metrics from aggregate counters and the wall
    /// clock of the run.
    pub fn compute(totals: &AggregateTotals, execution_secs: f64) -> Self {
        let mut metrics = CustomMetrics {
            reqs_num: totals.request_count,
            ..CustomMetrics::default()
        };
        if execution_secs > 0.0 {
            metrics.req_throughput = totals.request_count as f64 / execution_secs;
            metrics.completion_tps = totals.completion_tokens as f64 / execution_secs;
            metrics.total_tps = totals.total_tokens as f64 / execution_secs;
        } else {
            warn!("invalid execution time; throughput metrics set to 0");
        }
        if totals.request_count > 0 {
            metrics.avg_completion_tokens_per_req =
                totals.completion_tokens as f64 / totals.request_count as f64;
            metrics.avg_total_tokens_per_req =
                totals.total_tokens as f64 / totals.request_count as f64;
        }
        metrics
    }
}

/// One per-endpoint latency aggregate, as persisted and serialized.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct EndpointRow {
    pub task_id: String,
    pub metric_type: String,
    pub num_requests: u64,
    pub num_failures: u64,
    pub avg_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub median_latency: f64,
    pub p90_latency: f64,
    pub avg_content_length: f64,
    pub rps: f64,
    pub created_at: String,
}

/// Flatten a stats registry into persistable rows.
pub fn endpoint_rows(
    task_id: &str,
    registry: &StatsRegistry,
    execution_secs: f64,
) -> Vec<EndpointRow> {
    let created_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    registry
        .entries()
        .iter()
        .map(|(name, stats)| EndpointRow {
            task_id: task_id.to_owned(),
            metric_type: name.clone(),
            num_requests: stats.num_requests,
            num_failures: stats.num_failures,
            avg_latency: stats.avg_response_time(),
            min_latency: stats.min_response_time.unwrap_or(0.0),
            max_latency: stats.max_response_time,
            median_latency: stats.median_response_time(),
            p90_latency: stats.p90_response_time(),
            avg_content_length: stats.avg_content_length(),
            rps: if execution_secs > 0.0 {
                stats.num_requests as f64 / execution_secs
            } else {
                0.0
            },
            created_at: created_at.clone(),
        })
        .collect()
}

/// The complete hand-off artifact.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RunSnapshot {
    pub custom_metrics: CustomMetrics,
    pub locust_stats: Vec<EndpointRow>,
}

impl RunSnapshot {
    /// Total request failures across endpoint rows. Drives the generator's
    /// exit code.
    pub fn total_failures(&self) -> u64 {
        self.locust_stats.iter().map(|row| row.num_failures).sum()
    }
}

/// Where the snapshot for `task_id` lives.
pub fn snapshot_path(task_id: &str) -> PathBuf {
    std::env::temp_dir()
        .join("locust_result")
        .join(task_id)
        .join("result.json")
}

/// Write the snapshot, creating its directory.
pub fn write_snapshot(task_id: &str, snapshot: &RunSnapshot) -> Result<PathBuf> {
    let path = snapshot_path(task_id);
    let dir = path.parent().expect("snapshot path has a parent");
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {dir:?}"))?;
    let contents = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write {path:?}"))?;
    info!(task_id, ?path, "saved run snapshot");
    Ok(path)
}

/// Read the snapshot and remove its directory. The snapshot is consumed
/// exactly once; a missing file yields `None`.
pub fn read_and_remove_snapshot(task_id: &str) -> Result<Option<RunSnapshot>> {
    let path = snapshot_path(task_id);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {path:?}"))?;
    let snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("malformed snapshot at {path:?}"))?;
    if let Some(dir) = path.parent() {
        if let Err(err) = std::fs::remove_dir_all(dir) {
            warn!(?dir, "failed to remove snapshot directory: {err}");
        }
    }
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use crate::metrics::MetricEvent;

    use super::*;

    #[test]
    fn custom_metrics_from_totals() {
        let totals = AggregateTotals {
            request_count: 2000,
            completion_tokens: 20_000,
            total_tokens: 30_000,
        };
        let metrics = CustomMetrics::compute(&totals, 20.0);
        assert_eq!(metrics.reqs_num, 2000);
        assert_eq!(metrics.req_throughput, 100.0);
        assert_eq!(metrics.completion_tps, 1000.0);
        assert_eq!(metrics.total_tps, 1500.0);
        assert_eq!(metrics.avg_completion_tokens_per_req, 10.0);
        assert_eq!(metrics.avg_total_tokens_per_req, 15.0);
    }

    #[test]
    fn zero_requests_keep_averages_at_zero() {
        let metrics = CustomMetrics::compute(&AggregateTotals::default(), 10.0);
        assert_eq!(metrics.avg_completion_tokens_per_req, 0.0);
        assert_eq!(metrics.avg_total_tokens_per_req, 0.0);
    }

    #[test]
    fn zero_execution_time_keeps_throughput_at_zero() {
        let totals = AggregateTotals {
            request_count: 5,
            completion_tokens: 50,
            total_tokens: 60,
        };
        let metrics = CustomMetrics::compute(&totals, 0.0);
        assert_eq!(metrics.completion_tps, 0.0);
        assert_eq!(metrics.reqs_num, 5);
    }

    #[test]
    fn snapshot_json_uses_contract_keys() {
        let snapshot = RunSnapshot {
            custom_metrics: CustomMetrics::default(),
            locust_stats: vec![],
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("custom_metrics").is_some());
        assert!(value.get("locust_stats").is_some());
        let custom = &value["custom_metrics"];
        for key in [
            "reqs_num",
            "req_throughput",
            "completion_tps",
            "total_tps",
            "avg_total_tokens_per_req",
            "avg_completion_tokens_per_req",
        ] {
            assert!(custom.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn write_read_remove_cycle() {
        let task_id = format!("results-test-{}", uuid::Uuid::new_v4());
        let mut registry = StatsRegistry::new();
        registry.apply(&MetricEvent {
            name: "chat_completions".to_owned(),
            response_time_ms: 10.0,
            response_length: 3,
            success: true,
        });
        let snapshot = RunSnapshot {
            custom_metrics: CustomMetrics::default(),
            locust_stats: endpoint_rows(&task_id, &registry, 10.0),
        };

        let path = write_snapshot(&task_id, &snapshot).unwrap();
        assert!(path.exists());

        let read_back = read_and_remove_snapshot(&task_id).unwrap().unwrap();
        assert_eq!(read_back, snapshot);
        assert!(!path.exists());

        // Consumed exactly once: the second read finds nothing.
        assert!(read_and_remove_snapshot(&task_id).unwrap().is_none());
    }
}
