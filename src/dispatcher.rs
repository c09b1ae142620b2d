//! Task dispatch: the engine's two polling loops and the per-task
//! pipeline.
//!
//! The create loop claims pending tasks and drives them through spawn →
//! wait → persist. The stop loop watches for externally requested stops
//! and tears the matching process group down. Both loops share the store
//! and the supervisor and survive any single-task failure.

use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    dataset::DatasetMode,
    prelude::*,
    results,
    store::{Task, TaskStatus, TaskStore},
    supervisor::{RunOutcome, Supervisor},
};

const CREATE_POLL_INTERVAL: Duration = Duration::from_secs(3);
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(5);
const STORE_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Map a generator exit code onto the task's terminal status.
pub fn terminal_status_for_exit(exit_code: Option<i32>) -> TaskStatus {
    match exit_code {
        Some(0) => TaskStatus::Completed,
        Some(1) => TaskStatus::FailedRequests,
        _ => TaskStatus::Failed,
    }
}

pub struct Dispatcher {
    store: Arc<TaskStore>,
    supervisor: Arc<Supervisor>,
}

impl Dispatcher {
    pub fn new(store: Arc<TaskStore>, supervisor: Arc<Supervisor>) -> Self {
        Dispatcher { store, supervisor }
    }

    /// Poll for `created` tasks and run them, one at a time per loop.
    pub async fn run_create_loop(&self, cancel: CancellationToken) {
        info!("task creation poller started");
        loop {
            match self.store.claim_next_created() {
                Ok(Some(task)) => self.process_pipeline(task).await,
                Ok(None) => {}
                Err(err) => {
                    error!("task store unavailable in create poller: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(STORE_RETRY_BACKOFF) => continue,
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(CREATE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Poll for `stopping` tasks and terminate their process groups.
    /// Stops are idempotent: a group that already exited counts as
    /// stopped.
    pub async fn run_stop_loop(&self, cancel: CancellationToken) {
        info!("task stopping poller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(STOP_POLL_INTERVAL) => {}
            }
            let ids = match self.store.stopping_ids() {
                Ok(ids) => ids,
                Err(err) => {
                    error!("task store unavailable in stop poller: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(STORE_RETRY_BACKOFF) => {}
                    }
                    continue;
                }
            };
            for task_id in ids {
                info!(%task_id, "stop requested; terminating process group");
                if self.supervisor.terminate_task(&task_id).await {
                    let _ = self.store.update_status(
                        &task_id,
                        TaskStatus::Stopped,
                        None,
                    );
                } else {
                    error!(%task_id, "failed to stop process group");
                    let _ = self.store.update_status(
                        &task_id,
                        TaskStatus::Failed,
                        Some("Failed to terminate the generator process group."),
                    );
                }
            }
        }
    }

    /// Drive one claimed task to a terminal status.
    #[instrument(level = "info", skip_all, fields(task_id = %task.id))]
    pub async fn process_pipeline(&self, task: Task) {
        info!("starting processing pipeline");
        if let Err(err) = self.store.update_status(&task.id, TaskStatus::Running, None)
        {
            error!("could not mark task running: {err}");
            return;
        }

        let run_result = self.supervisor.run(&task).await;

        // The operator may have requested a stop while the run was live;
        // the refreshed state wins over the exit code.
        let refreshed_status = self
            .store
            .get(&task.id)
            .ok()
            .flatten()
            .map(|current| current.status);
        if matches!(
            refreshed_status,
            Some(TaskStatus::Stopping) | Some(TaskStatus::Stopped)
        ) {
            info!("task was stopped during execution");
            let _ = self
                .store
                .update_status(&task.id, TaskStatus::Stopped, None);
            // A snapshot may exist; it is never promoted for stopped runs.
            let _ = results::read_and_remove_snapshot(&task.id);
            self.cleanup_task_files(&task);
            return;
        }

        match run_result {
            Ok(outcome) => self.finalize_run(&task, outcome),
            Err(err) => {
                error!("supervision failed: {err:#}");
                let _ = self.store.update_status(
                    &task.id,
                    TaskStatus::Failed,
                    Some(&format!("{err:#}")),
                );
            }
        }
        self.cleanup_task_files(&task);
    }

    fn finalize_run(&self, task: &Task, outcome: RunOutcome) {
        let status = terminal_status_for_exit(outcome.exit_code);
        match status {
            TaskStatus::Completed | TaskStatus::FailedRequests => {
                let snapshot = match results::read_and_remove_snapshot(&task.id) {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        error!("unreadable run snapshot: {err:#}");
                        let _ = self.store.update_status(
                            &task.id,
                            TaskStatus::Failed,
                            Some(&format!("Unreadable run snapshot: {err:#}")),
                        );
                        return;
                    }
                };
                let Some(snapshot) = snapshot else {
                    let message = if status == TaskStatus::Completed {
                        "Run completed but no result file was generated."
                    } else {
                        "Run had request failures but no result file was generated."
                    };
                    error!("{message}");
                    let _ = self.store.update_status(
                        &task.id,
                        TaskStatus::Failed,
                        Some(message),
                    );
                    return;
                };

                if let Err(err) = self.store.insert_results(&task.id, &snapshot) {
                    error!("failed to persist results: {err:#}");
                    let _ = self.store.update_status(
                        &task.id,
                        TaskStatus::Failed,
                        Some(&format!("Failed to persist results: {err:#}")),
                    );
                    return;
                }
                match self.store.result_summary(&task.id) {
                    Ok(summary) => debug!(?summary, "persisted result rows"),
                    Err(err) => warn!("could not read back result rows: {err}"),
                }

                if status == TaskStatus::FailedRequests {
                    let failures = snapshot.total_failures();
                    warn!(failures, "run finished with request failures");
                    let _ = self.store.update_status(
                        &task.id,
                        TaskStatus::FailedRequests,
                        Some(&format!(
                            "Task {} completed with {failures} failed requests.",
                            task.id
                        )),
                    );
                } else {
                    info!("run completed successfully");
                    let _ =
                        self.store.update_status(&task.id, TaskStatus::Completed, None);
                }
            }
            _ => {
                let message = format!(
                    "Task execution failed (generator exit code: {:?}). Details: {}",
                    outcome.exit_code, outcome.stderr_tail
                );
                error!(exit_code = ?outcome.exit_code, "run failed");
                let _ = self
                    .store
                    .update_status(&task.id, TaskStatus::Failed, Some(&message));
            }
        }
    }

    /// Delete per-task files once the task reached a terminal status.
    /// Dataset selectors that are `default` or inline JSONL never touch
    /// the filesystem and are left alone.
    pub fn cleanup_task_files(&self, task: &Task) {
        let mut doomed: Vec<&str> = Vec::new();
        if DatasetMode::is_cleanup_candidate(&task.test_data) {
            doomed.push(&task.test_data);
        }
        for path in [&task.cert_file, &task.key_file] {
            if !path.trim().is_empty() {
                doomed.push(path);
            }
        }
        for raw in doomed {
            let path = Path::new(raw.trim());
            if !path.exists() {
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => info!(?path, "removed task file"),
                Err(err) => warn!(?path, "failed to remove task file: {err}"),
            }
        }
    }
}
