//! Process supervision for generator runs.
//!
//! The engine never hosts virtual users itself; every run is a separate
//! process group (one master, optionally N workers) spawned from this
//! binary's `generate` subcommand. The supervisor allocates the
//! coordination port, spawns and watches the group, captures its output
//! into the per-task log, tears the group down on completion or stop
//! requests, and reaps orphans left behind by crashes and restarts.

use std::{
    collections::{HashMap, VecDeque},
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    process::Command,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::mask_sensitive_command,
    prelude::*,
    proc,
    store::{Task, TaskStatus, TaskStore},
};

/// Coordination ports are drawn from this half-open range.
const PORT_RANGE: std::ops::Range<u16> = 5557..5657;

/// Grace allowed past the configured duration before the group is killed.
const STOP_TIMEOUT: Duration = Duration::from_secs(99);
const WAIT_TIMEOUT_BUFFER: Duration = Duration::from_secs(60);

/// Graceful-terminate and forced-kill windows during teardown.
const TERMINATE_WAIT: Duration = Duration::from_secs(10);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Orphaned generator processes older than this are reaped.
const ORPHAN_MIN_AGE: Duration = Duration::from_secs(5 * 60);
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Bytes of stderr retained for error reporting.
const STDERR_TAIL_BYTES: usize = 64 * 1024;

fn env_number(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

/// How many worker processes a run should use. Zero means the master
/// hosts the virtual users itself.
pub fn worker_process_count(concurrent_users: u32, cpu_count: usize) -> usize {
    let threshold = env_number("MULTIPROCESS_THRESHOLD", 1000);
    let min_users_per_process = env_number("MIN_USERS_PER_PROCESS", 600).max(1);
    let forced_single = std::env::var("FORCE_SINGLE_PROCESS")
        .map(|raw| raw.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if concurrent_users <= threshold || cpu_count <= 1 || forced_single {
        return 0;
    }
    let by_users = (concurrent_users / min_users_per_process) as usize;
    cpu_count.min(8).min(by_users).max(1)
}

/// The task id embedded in a generator process's argv, if it is one.
pub fn generator_task_id(args: &[String]) -> Option<String> {
    if !args.iter().any(|arg| arg == "generate") {
        return None;
    }
    for (index, arg) in args.iter().enumerate() {
        if arg == "--task-id" {
            return args.get(index + 1).cloned();
        }
        if let Some(value) = arg.strip_prefix("--task-id=") {
            return Some(value.to_owned());
        }
    }
    None
}

/// What the supervisor remembers about a live run.
#[derive(Clone, Debug)]
struct RunningGroup {
    master_pid: u32,
    worker_pids: Vec<u32>,
    port: u16,
}

/// Everything a finished run hands back to the pipeline.
#[derive(Debug)]
pub struct RunOutcome {
    /// The generator's exit code; `None` when it was killed by a signal or
    /// timed out.
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

pub struct Supervisor {
    ports: Mutex<HashMap<u16, String>>,
    /// Shared with background worker-capture tasks.
    groups: Arc<Mutex<HashMap<String, RunningGroup>>>,
    logs_dir: PathBuf,
}

impl Supervisor {
    pub fn new(logs_dir: PathBuf) -> Self {
        Supervisor {
            ports: Mutex::new(HashMap::new()),
            groups: Arc::new(Mutex::new(HashMap::new())),
            logs_dir,
        }
    }

    /// Reserve a free coordination port and record who owns it.
    fn allocate_port(&self, task_id: &str) -> Result<u16> {
        let mut ports = self.ports.lock().expect("lock poisoned");
        for port in PORT_RANGE {
            if ports.contains_key(&port) {
                continue;
            }
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                ports.insert(port, task_id.to_owned());
                return Ok(port);
            }
        }
        Err(anyhow!("no free coordination port in {PORT_RANGE:?}"))
    }

    fn release_port(&self, port: u16) {
        self.ports.lock().expect("lock poisoned").remove(&port);
    }

    /// Run a task's generator group to completion.
    #[instrument(level = "info", skip_all, fields(task_id = %task.id))]
    pub async fn run(&self, task: &Task) -> Result<RunOutcome> {
        let port = self.allocate_port(&task.id)?;
        let result = self.run_with_port(task, port).await;
        self.release_port(port);
        self.groups.lock().expect("lock poisoned").remove(&task.id);
        result
    }

    async fn run_with_port(&self, task: &Task, port: u16) -> Result<RunOutcome> {
        let binary =
            std::env::current_exe().context("failed to locate engine binary")?;
        let cpu_count = num_cpus::get();
        let processes = worker_process_count(task.concurrent_users, cpu_count);

        let mut args: Vec<String> = vec![
            "generate".to_owned(),
            "--host".to_owned(),
            task.target_host.clone(),
            "--users".to_owned(),
            task.concurrent_users.to_string(),
            "--spawn-rate".to_owned(),
            task.spawn_rate.to_string(),
            "--run-time".to_owned(),
            format!("{}s", task.duration),
            "--task-id".to_owned(),
            task.id.clone(),
            "--master-port".to_owned(),
            port.to_string(),
            "--api_path".to_owned(),
            if task.api_path.is_empty() {
                "/chat/completions".to_owned()
            } else {
                task.api_path.clone()
            },
            "--headers".to_owned(),
            task.headers.clone(),
            "--cookies".to_owned(),
            task.cookies.clone(),
            "--model_name".to_owned(),
            task.model.clone(),
            "--stream_mode".to_owned(),
            task.stream_mode.clone(),
            "--chat_type".to_owned(),
            task.chat_type.to_string(),
        ];
        if processes > 0 {
            args.push("--processes".to_owned());
            args.push(processes.to_string());
            info!(
                processes,
                cpu_count,
                users = task.concurrent_users,
                "multi-process generation enabled"
            );
        }
        for (flag, value) in [
            ("--request_payload", &task.request_payload),
            ("--field_mapping", &task.field_mapping),
            ("--test_data", &task.test_data),
            ("--cert_file", &task.cert_file),
            ("--key_file", &task.key_file),
        ] {
            if !value.is_empty() {
                args.push(flag.to_owned());
                args.push(value.clone());
            }
        }

        info!(
            command = mask_sensitive_command(&args).join(" "),
            "spawning generator"
        );
        let mut child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn generator process")?;
        let master_pid = child.id().context("spawned generator has no pid")?;
        info!(master_pid, port, "generator started");

        self.groups.lock().expect("lock poisoned").insert(
            task.id.clone(),
            RunningGroup {
                master_pid,
                worker_pids: Vec::new(),
                port,
            },
        );

        // Stream the group's output into the per-task log; keep a stderr
        // tail for error reporting.
        let log_path = self.task_log_path(&task.id);
        let stderr_tail = Arc::new(Mutex::new(VecDeque::<u8>::new()));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(copy_lines_to_log(
            stdout,
            log_path.clone(),
            None,
        ));
        let stderr_task = tokio::spawn(copy_lines_to_log(
            stderr,
            log_path.clone(),
            Some(stderr_tail.clone()),
        ));

        // Watch the master's children until the set is stable, so stop
        // requests can reach workers directly.
        let capture_groups = self.capture_worker_pids(&task.id, master_pid);

        let total_timeout =
            Duration::from_secs(task.duration) + STOP_TIMEOUT + WAIT_TIMEOUT_BUFFER;
        let exit_code = match timeout(total_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "generator exited");
                status.code()
            }
            Ok(Err(err)) => {
                error!("failed to wait for generator: {err}");
                None
            }
            Err(_) => {
                error!(
                    timeout_secs = total_timeout.as_secs(),
                    "generator timed out; terminating group"
                );
                self.terminate_group(&task.id).await;
                let _ = timeout(KILL_WAIT, child.wait()).await;
                None
            }
        };
        capture_groups.abort();

        let _ = stdout_task.await;
        let _ = stderr_task.await;
        self.terminate_group(&task.id).await;

        let tail_bytes: Vec<u8> = stderr_tail
            .lock()
            .expect("lock poisoned")
            .iter()
            .copied()
            .collect();
        Ok(RunOutcome {
            exit_code,
            stderr_tail: String::from_utf8_lossy(&tail_bytes).into_owned(),
        })
    }

    pub fn task_log_path(&self, task_id: &str) -> PathBuf {
        self.logs_dir.join(format!("task_{task_id}.log"))
    }

    /// Poll the master's child list until it is stable for 3 consecutive
    /// one-second intervals (or 15 s total), recording the worker PIDs.
    fn capture_worker_pids(
        &self,
        task_id: &str,
        master_pid: u32,
    ) -> tokio::task::JoinHandle<()> {
        let task_id = task_id.to_owned();
        let groups = self.groups.clone();
        tokio::spawn(async move {
            let mut last: Vec<u32> = Vec::new();
            let mut stable_rounds = 0;
            for _ in 0..15 {
                sleep(Duration::from_secs(1)).await;
                let mut current: Vec<u32> = proc::children_of(master_pid)
                    .into_iter()
                    .filter(|pid| {
                        proc::cmdline(*pid)
                            .map(|args| generator_task_id(&args).is_some())
                            .unwrap_or(false)
                    })
                    .collect();
                current.sort_unstable();
                if !current.is_empty() && current == last {
                    stable_rounds += 1;
                    if stable_rounds >= 3 {
                        break;
                    }
                } else {
                    stable_rounds = 0;
                    last = current;
                }
            }
            if !last.is_empty() {
                debug!(%task_id, workers = ?last, "captured worker pids");
                let mut groups = groups.lock().expect("lock poisoned");
                if let Some(group) = groups.get_mut(&task_id) {
                    group.worker_pids = last;
                }
            }
        })
    }

    /// Terminate the process group of a task: graceful first, forced for
    /// whatever survives. Idempotent; terminating an absent or dead group
    /// succeeds.
    pub async fn terminate_task(&self, task_id: &str) -> bool {
        self.terminate_group(task_id).await
    }

    async fn terminate_group(&self, task_id: &str) -> bool {
        let group = self
            .groups
            .lock()
            .expect("lock poisoned")
            .get(task_id)
            .cloned();
        let Some(group) = group else {
            return true;
        };

        let mut pids = vec![group.master_pid];
        pids.extend(&group.worker_pids);
        pids.retain(|pid| proc::is_alive(*pid));
        if pids.is_empty() {
            return true;
        }

        for pid in &pids {
            proc::terminate(*pid);
        }
        if wait_for_exit(&pids, TERMINATE_WAIT).await {
            info!(task_id, "process group terminated gracefully");
            return true;
        }

        pids.retain(|pid| proc::is_alive(*pid));
        warn!(task_id, residual = ?pids, "forcing kill of residual processes");
        for pid in &pids {
            proc::kill(*pid);
        }
        if wait_for_exit(&pids, KILL_WAIT).await {
            return true;
        }
        let unkillable: Vec<u32> =
            pids.iter().copied().filter(|pid| proc::is_alive(*pid)).collect();
        error!(task_id, ?unkillable, "process group has unkillable members");
        false
    }

    /// Startup reconciliation: tasks left `running` or `locked` by a
    /// previous engine instance are resolved against the live process
    /// table and marked failed.
    pub fn reconcile_on_startup(&self, store: &TaskStore) -> Result<()> {
        info!("reconciling tasks on startup");
        let stale =
            store.tasks_with_status(&[TaskStatus::Running, TaskStatus::Locked])?;
        if stale.is_empty() {
            info!("no running or locked tasks found to reconcile");
            return Ok(());
        }

        for task in stale {
            if task.status == TaskStatus::Locked {
                warn!(
                    task_id = task.id,
                    "task was locked during restart; it never started"
                );
                store.update_status(
                    &task.id,
                    TaskStatus::Failed,
                    Some("Task was aborted before execution due to an engine restart."),
                )?;
                continue;
            }

            let orphan_pids: Vec<u32> = proc::list_pids()
                .into_iter()
                .filter(|pid| {
                    proc::cmdline(*pid)
                        .and_then(|args| generator_task_id(&args))
                        .is_some_and(|id| id == task.id)
                })
                .collect();

            if orphan_pids.is_empty() {
                warn!(
                    task_id = task.id,
                    "task was running but no process carries it; marking failed"
                );
                store.update_status(
                    &task.id,
                    TaskStatus::Failed,
                    Some("Task process was not found after an engine restart."),
                )?;
            } else {
                warn!(
                    task_id = task.id,
                    pids = ?orphan_pids,
                    "terminating orphaned generator group from previous engine"
                );
                for pid in &orphan_pids {
                    proc::terminate(*pid);
                }
                store.update_status(
                    &task.id,
                    TaskStatus::Failed,
                    Some(
                        "Task process was orphaned by an engine restart and has been terminated.",
                    ),
                )?;
            }
        }
        Ok(())
    }

    /// Periodic sweep for generator processes nobody owns anymore.
    pub async fn run_orphan_reaper(
        self: Arc<Self>,
        store: Arc<TaskStore>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(ORPHAN_SWEEP_INTERVAL) => {}
            }
            if let Err(err) = self.sweep_orphans(&store) {
                warn!("orphan sweep failed: {err}");
            }
        }
    }

    fn sweep_orphans(&self, store: &TaskStore) -> Result<()> {
        let active: Vec<String> = {
            let groups = self.groups.lock().expect("lock poisoned");
            let mut ids: Vec<String> = groups.keys().cloned().collect();
            for task in
                store.tasks_with_status(&[TaskStatus::Running, TaskStatus::Locked])?
            {
                ids.push(task.id);
            }
            ids
        };
        let own_pid = std::process::id();

        for pid in proc::list_pids() {
            if pid == own_pid {
                continue;
            }
            let Some(args) = proc::cmdline(pid) else { continue };
            let Some(task_id) = generator_task_id(&args) else { continue };
            if active.iter().any(|id| *id == task_id) {
                continue;
            }
            let Some(age) = proc::process_age(pid) else { continue };
            if age <= ORPHAN_MIN_AGE {
                continue;
            }
            warn!(pid, %task_id, age_secs = age.as_secs(), "reaping orphaned generator");
            proc::terminate(pid);
        }
        Ok(())
    }
}

/// Poll until every pid exited or the window elapsed.
async fn wait_for_exit(pids: &[u32], window: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        if pids.iter().all(|pid| !proc::is_alive(*pid)) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(200)).await;
    }
}

/// Copy a child stream into the per-task log line by line; optionally
/// retain a bounded tail.
async fn copy_lines_to_log<R>(
    source: Option<R>,
    log_path: PathBuf,
    tail: Option<Arc<Mutex<VecDeque<u8>>>>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(source) = source else { return };
    let mut log = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(file) => file,
        Err(err) => {
            warn!(?log_path, "failed to open task log: {err}");
            return;
        }
    };
    let mut lines = BufReader::new(source).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = log.write_all(line.as_bytes()).await;
        let _ = log.write_all(b"\n").await;
        if let Some(tail) = &tail {
            let mut tail = tail.lock().expect("lock poisoned");
            tail.extend(line.as_bytes());
            tail.push_back(b'\n');
            while tail.len() > STDERR_TAIL_BYTES {
                tail.pop_front();
            }
        }
    }
    let _ = log.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_below_threshold() {
        assert_eq!(worker_process_count(1000, 8), 0);
        assert_eq!(worker_process_count(1, 8), 0);
        assert_eq!(worker_process_count(5000, 1), 0);
    }

    #[test]
    fn worker_count_scales_with_users_and_cpus() {
        assert_eq!(worker_process_count(2000, 8), 3);
        assert_eq!(worker_process_count(2000, 2), 2);
        assert_eq!(worker_process_count(1201, 16), 2);
        // Capped at 8 regardless of core count.
        assert_eq!(worker_process_count(5000, 32), 8);
    }

    #[test]
    fn generator_task_ids_are_extracted() {
        let args: Vec<String> = [
            "/usr/bin/llm-meter",
            "generate",
            "--host",
            "http://x",
            "--task-id",
            "abc-123",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(generator_task_id(&args), Some("abc-123".to_owned()));

        let eq_form: Vec<String> =
            ["llm-meter", "generate", "--task-id=zz"].iter().map(|s| s.to_string()).collect();
        assert_eq!(generator_task_id(&eq_form), Some("zz".to_owned()));

        let not_generator: Vec<String> =
            ["other", "--task-id", "abc"].iter().map(|s| s.to_string()).collect();
        assert_eq!(generator_task_id(&not_generator), None);
    }

    #[test]
    fn port_allocation_is_exclusive_per_task() {
        let supervisor = Supervisor::new(std::env::temp_dir());
        let a = supervisor.allocate_port("task-a").unwrap();
        let b = supervisor.allocate_port("task-b").unwrap();
        assert_ne!(a, b);
        assert!(PORT_RANGE.contains(&a));
        supervisor.release_port(a);
        let c = supervisor.allocate_port("task-c").unwrap();
        assert_eq!(c, a);
    }

    #[tokio::test]
    async fn terminating_an_unknown_group_is_success() {
        let supervisor = Supervisor::new(std::env::temp_dir());
        assert!(supervisor.terminate_task("never-started").await);
    }
}
