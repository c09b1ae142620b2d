//! Whole-process generator runs: exit codes and the snapshot hand-off.

use std::process::Command;

use assert_cmd::prelude::*;
use llm_meter::results;
use uuid::Uuid;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

fn generate_cmd(host: &str, task_id: &str) -> Command {
    let mut cmd = Command::cargo_bin("llm-meter").unwrap();
    cmd.arg("generate")
        .arg("--host")
        .arg(host)
        .arg("--users")
        .arg("1")
        .arg("--spawn-rate")
        .arg("100")
        .arg("--run-time")
        .arg("2s")
        .arg("--task-id")
        .arg(task_id)
        .arg("--model_name")
        .arg("test-model");
    cmd
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_run_exits_zero_and_writes_a_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(
                    concat!(
                        "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
                        "data: [DONE]\n\n",
                    ),
                    "text/event-stream",
                ),
        )
        .mount(&server)
        .await;

    let task_id = format!("e2e-{}", Uuid::new_v4());
    let host = server.uri();
    let expected_task_id = task_id.clone();
    tokio::task::spawn_blocking(move || {
        generate_cmd(&host, &expected_task_id).assert().code(0);
    })
    .await
    .unwrap();

    let snapshot = results::read_and_remove_snapshot(&task_id)
        .unwrap()
        .expect("snapshot should exist after a clean run");
    assert!(snapshot.custom_metrics.reqs_num >= 1);
    assert!(snapshot.custom_metrics.completion_tps > 0.0);
    let chat = snapshot
        .locust_stats
        .iter()
        .find(|row| row.metric_type == "chat_completions")
        .expect("per-endpoint row for chat_completions");
    assert_eq!(chat.num_failures, 0);
    assert_eq!(chat.task_id, task_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_requests_exit_with_code_one() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let task_id = format!("e2e-{}", Uuid::new_v4());
    let host = server.uri();
    let expected_task_id = task_id.clone();
    tokio::task::spawn_blocking(move || {
        generate_cmd(&host, &expected_task_id).assert().code(1);
    })
    .await
    .unwrap();

    let snapshot = results::read_and_remove_snapshot(&task_id)
        .unwrap()
        .expect("snapshot is written even for failing runs");
    let chat = snapshot
        .locust_stats
        .iter()
        .find(|row| row.metric_type == "chat_completions")
        .unwrap();
    assert!(chat.num_failures >= 1);
    // No request completed, so the token counters stayed at zero.
    assert_eq!(snapshot.custom_metrics.reqs_num, 0);
    assert_eq!(snapshot.custom_metrics.completion_tps, 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_host_still_finishes_with_failures() {
    // Nothing listens on this port; every request fails at transport level.
    let task_id = format!("e2e-{}", Uuid::new_v4());
    let expected_task_id = task_id.clone();
    tokio::task::spawn_blocking(move || {
        generate_cmd("http://127.0.0.1:9", &expected_task_id)
            .assert()
            .code(1);
    })
    .await
    .unwrap();

    let snapshot = results::read_and_remove_snapshot(&task_id).unwrap().unwrap();
    assert_eq!(snapshot.custom_metrics.reqs_num, 0);
}
