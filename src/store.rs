//! The task store: the only cross-process shared mutable resource.
//!
//! An embedded SQL database holding the `tasks` and `task_results`
//! tables. Claims are serialized through immediate transactions, and
//! terminal statuses are write-protected at the SQL layer, so no caller
//! can resurrect a finished task.

use std::sync::Mutex;

use chrono::Local;
use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior, params};
use uuid::Uuid;

use crate::{prelude::*, results::RunSnapshot};

/// Task lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Locked,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
    FailedRequests,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Locked => "locked",
            TaskStatus::Running => "running",
            TaskStatus::Stopping => "stopping",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::FailedRequests => "failed_requests",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(match raw {
            "created" => TaskStatus::Created,
            "locked" => TaskStatus::Locked,
            "running" => TaskStatus::Running,
            "stopping" => TaskStatus::Stopping,
            "stopped" => TaskStatus::Stopped,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "failed_requests" => TaskStatus::FailedRequests,
            other => return Err(anyhow!("unknown task status: {other:?}")),
        })
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::FailedRequests
                | TaskStatus::Stopped
        )
    }
}

/// One row of the `tasks` table.
#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub target_host: String,
    pub api_path: String,
    pub model: String,
    /// Textual boolean, as the wire contract spells it.
    pub stream_mode: String,
    pub concurrent_users: u32,
    pub spawn_rate: u32,
    pub duration: u64,
    pub chat_type: u8,
    pub headers: String,
    pub cookies: String,
    pub cert_file: String,
    pub key_file: String,
    pub request_payload: String,
    pub field_mapping: String,
    pub test_data: String,
    pub error_message: String,
}

impl Task {
    /// A minimal task useful for tests and tooling.
    pub fn new(id: impl Into<String>, target_host: impl Into<String>) -> Self {
        Task {
            id: id.into(),
            name: String::new(),
            status: TaskStatus::Created,
            target_host: target_host.into(),
            api_path: "/chat/completions".to_owned(),
            model: String::new(),
            stream_mode: "true".to_owned(),
            concurrent_users: 1,
            spawn_rate: 1,
            duration: 1,
            chat_type: 0,
            headers: String::new(),
            cookies: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            request_payload: String::new(),
            field_mapping: String::new(),
            test_data: String::new(),
            error_message: String::new(),
        }
    }
}

const TASK_COLUMNS: &str = "id, name, status, target_host, api_path, model, \
     stream_mode, concurrent_users, spawn_rate, duration, chat_type, headers, \
     cookies, cert_file, key_file, request_payload, field_mapping, test_data, \
     error_message";

/// Thread-safe handle to the embedded store.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    /// Open (and if needed create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open task store at {path:?}"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = TaskStore {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                target_host TEXT NOT NULL,
                api_path TEXT NOT NULL DEFAULT '/chat/completions',
                model TEXT NOT NULL DEFAULT '',
                stream_mode TEXT NOT NULL DEFAULT 'true',
                concurrent_users INTEGER NOT NULL DEFAULT 1,
                spawn_rate INTEGER NOT NULL DEFAULT 1,
                duration INTEGER NOT NULL DEFAULT 60,
                chat_type INTEGER NOT NULL DEFAULT 0,
                headers TEXT NOT NULL DEFAULT '',
                cookies TEXT NOT NULL DEFAULT '',
                cert_file TEXT NOT NULL DEFAULT '',
                key_file TEXT NOT NULL DEFAULT '',
                request_payload TEXT NOT NULL DEFAULT '',
                field_mapping TEXT NOT NULL DEFAULT '',
                test_data TEXT NOT NULL DEFAULT '',
                error_message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_results (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                metric_type TEXT NOT NULL,
                num_requests INTEGER NOT NULL DEFAULT 0,
                num_failures INTEGER NOT NULL DEFAULT 0,
                avg_latency REAL NOT NULL DEFAULT 0,
                min_latency REAL NOT NULL DEFAULT 0,
                max_latency REAL NOT NULL DEFAULT 0,
                median_latency REAL NOT NULL DEFAULT 0,
                p90_latency REAL NOT NULL DEFAULT 0,
                rps REAL NOT NULL DEFAULT 0,
                avg_content_length REAL NOT NULL DEFAULT 0,
                completion_tps REAL NOT NULL DEFAULT 0,
                total_tps REAL NOT NULL DEFAULT 0,
                avg_total_tokens_per_req REAL NOT NULL DEFAULT 0,
                avg_completion_tokens_per_req REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Insert a new task in `created` state.
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let now = timestamp();
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS}, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)"
            ),
            params![
                task.id,
                task.name,
                task.status.as_str(),
                task.target_host,
                task.api_path,
                task.model,
                task.stream_mode,
                task.concurrent_users,
                task.spawn_rate,
                task.duration,
                task.chat_type,
                task.headers,
                task.cookies,
                task.cert_file,
                task.key_file,
                task.request_payload,
                task.field_mapping,
                task.test_data,
                task.error_message,
                now,
                now,
            ],
        )?;
        Ok(())
    }

    /// Atomically claim the next `created` task, moving it to `locked`.
    ///
    /// The immediate transaction serializes competing claimants: for any
    /// given task, exactly one claim succeeds.
    pub fn claim_next_created(&self) -> Result<Option<Task>> {
        let mut conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id: Option<String> = tx
            .query_row(
                "SELECT id FROM tasks WHERE status = 'created'
                 ORDER BY created_at LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            tx.commit()?;
            return Ok(None);
        };
        let updated = tx.execute(
            "UPDATE tasks SET status = 'locked', updated_at = ?1
             WHERE id = ?2 AND status = 'created'",
            params![timestamp(), id],
        )?;
        tx.commit()?;
        if updated != 1 {
            return Ok(None);
        }
        drop(conn);
        let task = self.get(&id)?;
        if let Some(task) = &task {
            info!(task_id = %task.id, "claimed and locked new task");
        }
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            row_to_task,
        )
        .optional()
        .context("failed to load task")
    }

    /// Update a task's status (and optionally its error message).
    ///
    /// Terminal statuses are immutable: the update is silently skipped and
    /// `false` returned when the task already finished.
    pub fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let error_message = error_message.map(crate::errors::truncate_error_message);
        let conn = self.conn.lock().expect("lock poisoned");
        let updated = conn.execute(
            "UPDATE tasks
             SET status = ?1,
                 error_message = COALESCE(?2, error_message),
                 updated_at = ?3
             WHERE id = ?4
               AND status NOT IN ('completed','failed','failed_requests','stopped')",
            params![status.as_str(), error_message, timestamp(), id],
        )?;
        Ok(updated == 1)
    }

    /// Ids of tasks an operator asked to stop.
    pub fn stopping_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut statement =
            conn.prepare("SELECT id FROM tasks WHERE status = 'stopping'")?;
        let ids = statement
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Tasks currently in any of the given states.
    pub fn tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let placeholders = statuses
            .iter()
            .map(|status| format!("'{}'", status.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        let conn = self.conn.lock().expect("lock poisoned");
        let mut statement = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ({placeholders})"
        ))?;
        let tasks = statement
            .query_map([], row_to_task)?
            .collect::<std::result::Result<Vec<Task>, _>>()?;
        Ok(tasks)
    }

    /// Persist a run snapshot: one row per endpoint aggregate plus exactly
    /// one `token_metrics` row, all in a single transaction.
    pub fn insert_results(&self, task_id: &str, snapshot: &RunSnapshot) -> Result<()> {
        let now = timestamp();
        let mut conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.transaction()?;
        for row in &snapshot.locust_stats {
            if row.task_id.is_empty() {
                warn!("skipping stat row without a task id");
                continue;
            }
            tx.execute(
                "INSERT INTO task_results (
                    id, task_id, metric_type, num_requests, num_failures,
                    avg_latency, min_latency, max_latency, median_latency,
                    p90_latency, rps, avg_content_length, created_at, updated_at
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
                params![
                    Uuid::new_v4().to_string(),
                    row.task_id,
                    row.metric_type,
                    row.num_requests,
                    row.num_failures,
                    row.avg_latency,
                    row.min_latency,
                    row.max_latency,
                    row.median_latency,
                    row.p90_latency,
                    row.rps,
                    row.avg_content_length,
                    row.created_at,
                    now,
                ],
            )?;
        }
        let custom = &snapshot.custom_metrics;
        tx.execute(
            "INSERT INTO task_results (
                id, task_id, metric_type, completion_tps, total_tps,
                avg_total_tokens_per_req, avg_completion_tokens_per_req,
                created_at, updated_at
             ) VALUES (?1,?2,'token_metrics',?3,?4,?5,?6,?7,?8)",
            params![
                Uuid::new_v4().to_string(),
                task_id,
                custom.completion_tps,
                custom.total_tps,
                custom.avg_total_tokens_per_req,
                custom.avg_completion_tokens_per_req,
                now,
                now,
            ],
        )?;
        tx.commit()?;
        info!(task_id, "inserted run results");
        Ok(())
    }

    /// Result rows for a task, as `(metric_type, num_requests, num_failures)`.
    pub fn result_summary(&self, task_id: &str) -> Result<Vec<(String, u64, u64)>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut statement = conn.prepare(
            "SELECT metric_type, num_requests, num_failures
             FROM task_results WHERE task_id = ?1 ORDER BY metric_type",
        )?;
        let rows = statement
            .query_map(params![task_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(2)?;
    let status = TaskStatus::parse(&status_raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("bad status {status_raw:?}").into(),
        )
    })?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        status,
        target_host: row.get(3)?,
        api_path: row.get(4)?,
        model: row.get(5)?,
        stream_mode: row.get(6)?,
        concurrent_users: row.get(7)?,
        spawn_rate: row.get(8)?,
        duration: row.get(9)?,
        chat_type: row.get(10)?,
        headers: row.get(11)?,
        cookies: row.get(12)?,
        cert_file: row.get(13)?,
        key_file: row.get(14)?,
        request_payload: row.get(15)?,
        field_mapping: row.get(16)?,
        test_data: row.get(17)?,
        error_message: row.get(18)?,
    })
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
