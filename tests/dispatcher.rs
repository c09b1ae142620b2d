//! Task lifecycle tests: exclusive claims, terminal monotonicity,
//! startup reconciliation and terminal-status file cleanup.

use std::sync::Arc;

use llm_meter::{
    dispatcher::Dispatcher,
    store::{Task, TaskStatus, TaskStore},
    supervisor::Supervisor,
};

fn open_store(dir: &tempfile::TempDir) -> Arc<TaskStore> {
    Arc::new(TaskStore::open(&dir.path().join("tasks.db")).unwrap())
}

#[test]
fn at_most_one_claim_succeeds_per_task() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.insert_task(&Task::new("only-task", "http://host")).unwrap();

    let mut claimants = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        claimants.push(std::thread::spawn(move || {
            store.claim_next_created().unwrap().is_some()
        }));
    }
    let successes: usize = claimants
        .into_iter()
        .map(|handle| handle.join().unwrap() as usize)
        .sum();

    assert_eq!(successes, 1);
    let task = store.get("only-task").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Locked);
}

#[test]
fn claims_hand_out_distinct_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.insert_task(&Task::new("a", "h")).unwrap();
    store.insert_task(&Task::new("b", "h")).unwrap();

    let first = store.claim_next_created().unwrap().unwrap();
    let second = store.claim_next_created().unwrap().unwrap();
    assert_ne!(first.id, second.id);
    assert!(store.claim_next_created().unwrap().is_none());
}

#[test]
fn terminal_statuses_never_change_again() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    for (id, terminal) in [
        ("c", TaskStatus::Completed),
        ("f", TaskStatus::Failed),
        ("fr", TaskStatus::FailedRequests),
        ("s", TaskStatus::Stopped),
    ] {
        store.insert_task(&Task::new(id, "h")).unwrap();
        assert!(store.update_status(id, terminal, None).unwrap());
        for attempt in [
            TaskStatus::Created,
            TaskStatus::Running,
            TaskStatus::Stopping,
            TaskStatus::Completed,
        ] {
            assert!(!store.update_status(id, attempt, None).unwrap());
        }
        assert_eq!(store.get(id).unwrap().unwrap().status, terminal);
    }
}

#[test]
fn reconciliation_fails_tasks_without_processes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let supervisor = Supervisor::new(dir.path().to_path_buf());

    store.insert_task(&Task::new("was-running", "h")).unwrap();
    store
        .update_status("was-running", TaskStatus::Running, None)
        .unwrap();
    store.insert_task(&Task::new("was-locked", "h")).unwrap();
    store
        .update_status("was-locked", TaskStatus::Locked, None)
        .unwrap();

    supervisor.reconcile_on_startup(&store).unwrap();

    let running = store.get("was-running").unwrap().unwrap();
    assert_eq!(running.status, TaskStatus::Failed);
    assert_eq!(
        running.error_message,
        "Task process was not found after an engine restart."
    );

    let locked = store.get("was-locked").unwrap().unwrap();
    assert_eq!(locked.status, TaskStatus::Failed);
    assert_eq!(
        locked.error_message,
        "Task was aborted before execution due to an engine restart."
    );
}

#[test]
fn reconciliation_leaves_settled_tasks_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let supervisor = Supervisor::new(dir.path().to_path_buf());

    store.insert_task(&Task::new("done", "h")).unwrap();
    store.update_status("done", TaskStatus::Completed, None).unwrap();
    store.insert_task(&Task::new("fresh", "h")).unwrap();

    supervisor.reconcile_on_startup(&store).unwrap();

    assert_eq!(
        store.get("done").unwrap().unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(
        store.get("fresh").unwrap().unwrap().status,
        TaskStatus::Created
    );
}

#[test]
fn terminal_cleanup_removes_uploaded_files_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let supervisor = Arc::new(Supervisor::new(dir.path().to_path_buf()));
    let dispatcher = Dispatcher::new(store, supervisor);

    let dataset_path = dir.path().join("data.jsonl");
    let cert_path = dir.path().join("client.pem");
    let key_path = dir.path().join("client.key");
    std::fs::write(&dataset_path, "{\"id\":\"1\",\"prompt\":\"hi\"}\n").unwrap();
    std::fs::write(&cert_path, "cert").unwrap();
    std::fs::write(&key_path, "key").unwrap();

    let mut task = Task::new("cleanup", "h");
    task.test_data = dataset_path.display().to_string();
    task.cert_file = cert_path.display().to_string();
    task.key_file = key_path.display().to_string();
    dispatcher.cleanup_task_files(&task);

    assert!(!dataset_path.exists());
    assert!(!cert_path.exists());
    assert!(!key_path.exists());

    // Inline JSONL and the built-in dataset are not filesystem paths and
    // must never trigger deletions.
    let mut inline = Task::new("inline", "h");
    inline.test_data = "{\"id\":\"1\",\"prompt\":\"hi\"}".to_owned();
    dispatcher.cleanup_task_files(&inline);
    let mut builtin = Task::new("builtin", "h");
    builtin.test_data = "default".to_owned();
    dispatcher.cleanup_task_files(&builtin);
}
