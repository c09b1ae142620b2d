//! Cross-worker aggregation properties: snapshot idempotence and
//! multi-worker totals.

use llm_meter::{
    coordinator::{BusMessage, MasterState},
    metrics::WireStats,
    results::CustomMetrics,
    worker::WorkerSnapshot,
};

fn snapshot(
    worker_id: &str,
    seq: u64,
    request_count: u64,
    completion_tokens: u64,
) -> WorkerSnapshot {
    WorkerSnapshot {
        worker_id: worker_id.to_owned(),
        pid: 1,
        request_id: format!("{worker_id}_{seq}"),
        timestamp: seq as f64,
        request_count,
        completion_tokens,
        total_tokens: completion_tokens + request_count,
        stats: WireStats::new(),
    }
}

#[test]
fn feeding_the_same_snapshot_many_times_equals_feeding_it_once() {
    let payload = snapshot("w1", 1, 500, 5000);

    let mut once = MasterState::new();
    once.handle(BusMessage::WorkerCustomMetrics(payload.clone()));

    let mut many = MasterState::new();
    for _ in 0..10 {
        many.handle(BusMessage::WorkerCustomMetrics(payload.clone()));
    }

    assert_eq!(once.aggregate(), many.aggregate());
}

#[test]
fn four_workers_aggregate_to_the_run_totals() {
    let mut state = MasterState::new();
    let request_counts = [500u64, 501, 499, 500];
    let completion_tokens = [5000u64, 5010, 4990, 5000];
    for (index, (requests, tokens)) in
        request_counts.iter().zip(completion_tokens).enumerate()
    {
        state.handle(BusMessage::WorkerCustomMetrics(snapshot(
            &format!("{}_{}", 1000 + index, index),
            1,
            *requests,
            tokens,
        )));
    }

    let totals = state.aggregate();
    assert_eq!(totals.request_count, 2000);
    assert_eq!(totals.completion_tokens, 20_000);

    let metrics = CustomMetrics::compute(&totals, 20.0);
    assert_eq!(metrics.reqs_num, 2000);
    assert_eq!(metrics.completion_tps, 1000.0);

    // Duplicate deliveries from one worker change nothing.
    state.handle(BusMessage::WorkerCustomMetrics(snapshot(
        "1000_0", 1, 500, 5000,
    )));
    let again = state.aggregate();
    assert_eq!(again.request_count, 2000);
    assert_eq!(again.completion_tokens, 20_000);
}

#[test]
fn resent_cumulative_snapshot_replaces_rather_than_doubles() {
    let mut state = MasterState::new();
    state.handle(BusMessage::WorkerCustomMetrics(snapshot("w1", 1, 100, 1000)));
    state.handle(BusMessage::WorkerCustomMetrics(snapshot("w2", 1, 50, 500)));
    // w1 reports again later in the run with larger cumulative counters.
    state.handle(BusMessage::WorkerCustomMetrics(snapshot("w1", 2, 150, 1500)));

    let totals = state.aggregate();
    assert_eq!(totals.request_count, 200);
    assert_eq!(totals.completion_tokens, 2000);
}
