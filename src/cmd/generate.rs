//! The `generate` subcommand: the load-generator process itself.
//!
//! The supervisor spawns one of these per run. With `--processes 0` the
//! process hosts the virtual users directly; with N > 0 it becomes the
//! master of a group, spawning N workers of itself (`--worker`) and
//! collecting their metrics over the coordination channel.
//!
//! Exit codes are part of the wire contract: 0 means every request
//! succeeded, 1 means the run finished but at least one request failed,
//! anything else is an execution error.

use std::{
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Args;
use tokio::{
    process::Command,
    signal::unix::{SignalKind, signal},
    time::{Instant, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{self, CertConfig, RunConfig},
    coordinator::{
        BusMessage, MasterBus, MasterState, WorkerBus, collect_final_metrics,
    },
    dataset::PromptSource,
    fieldmap::FieldMapping,
    metrics::StatsRegistry,
    prelude::*,
    results::{CustomMetrics, RunSnapshot, endpoint_rows, write_snapshot},
    user::{UserContext, run_user_fleet},
    worker::WorkerAggregator,
};

/// Exit codes of the generator process.
pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILED_REQUESTS: u8 = 1;
pub const EXIT_EXECUTION_ERROR: u8 = 2;

/// How long a worker stays reachable after its run time, so the master
/// can still collect final metrics.
const WORKER_LINGER: Duration = Duration::from_secs(30);
/// How long the master waits for spawned workers to exit on their own.
const WORKER_EXIT_WAIT: Duration = Duration::from_secs(30);
/// Master↔worker liveness probe interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Generate command line arguments.
///
/// The long flag spellings are a wire contract with the supervisor and
/// with external tooling, underscores included.
#[derive(Debug, Args)]
pub struct GenerateOpts {
    /// Target host, e.g. `http://10.0.0.2:8000`.
    #[clap(long)]
    pub host: String,

    /// Number of concurrent virtual users.
    #[clap(long, default_value_t = 1)]
    pub users: u32,

    /// Users spawned per second during ramp-up.
    #[clap(long = "spawn-rate", default_value_t = 1.0)]
    pub spawn_rate: f64,

    /// Run time, as plain seconds or with an `s` suffix.
    #[clap(long = "run-time", default_value = "60s")]
    pub run_time: String,

    /// Worker processes to spawn; 0 runs the users in-process.
    #[clap(long, default_value_t = 0)]
    pub processes: usize,

    /// The task this run belongs to.
    #[clap(long = "task-id", default_value = "")]
    pub task_id: String,

    /// Coordination port for the master↔worker channel.
    #[clap(long = "master-port", default_value_t = 0)]
    pub master_port: u16,

    /// API path suffix; `/chat/completions` selects OpenAI mode.
    #[clap(long = "api_path", default_value = "/chat/completions")]
    pub api_path: String,

    /// Request headers as a JSON object.
    #[clap(long, default_value = "")]
    pub headers: String,

    /// Request cookies as a JSON object.
    #[clap(long, default_value = "")]
    pub cookies: String,

    /// JSON request template; empty synthesizes a chat payload.
    #[clap(long = "request_payload", default_value = "")]
    pub request_payload: String,

    /// Model identifier, used for tokenization and payload defaults.
    #[clap(long = "model_name", default_value = "")]
    pub model_name: String,

    /// Optional system message prepended to every chat.
    #[clap(long = "system_prompt", default_value = "")]
    pub system_prompt: String,

    /// Streaming vs. single-shot responses.
    #[clap(long = "stream_mode", default_value = "true")]
    pub stream_mode: String,

    /// 0 = text chat, 1 = multimodal.
    #[clap(long = "chat_type", default_value_t = 0)]
    pub chat_type: u8,

    /// Client certificate file (PEM; may bundle the key).
    #[clap(long = "cert_file", default_value = "")]
    pub cert_file: String,

    /// Client private key file.
    #[clap(long = "key_file", default_value = "")]
    pub key_file: String,

    /// Field mapping as a JSON object, for custom APIs.
    #[clap(long = "field_mapping", default_value = "")]
    pub field_mapping: String,

    /// Dataset selector: empty, `default`, inline JSONL, or a file path.
    #[clap(long = "test_data", default_value = "")]
    pub test_data: String,

    /// Internal: run as a worker attached to the master port.
    #[clap(long, hide = true)]
    pub worker: bool,
}

/// Build the immutable run configuration from the parsed flags.
pub fn build_run_config(opts: &GenerateOpts) -> Result<RunConfig> {
    let field_mapping = FieldMapping::parse(&opts.field_mapping)?;
    let duration = config::parse_run_time(&opts.run_time)?;
    let config = RunConfig {
        task_id: if opts.task_id.is_empty() {
            "unknown".to_owned()
        } else {
            opts.task_id.clone()
        },
        host: opts.host.clone(),
        api_path: opts.api_path.clone(),
        headers: config::parse_headers(&opts.headers),
        cookies: config::parse_cookies(&opts.cookies),
        request_payload: opts.request_payload.clone(),
        model_name: opts.model_name.clone(),
        system_prompt: opts.system_prompt.clone(),
        stream_mode: config::parse_bool_flag(&opts.stream_mode),
        chat_type: opts.chat_type,
        cert: CertConfig::resolve(&opts.cert_file, &opts.key_file),
        field_mapping,
        test_data: opts.test_data.clone(),
        duration,
        concurrent_users: opts.users,
        spawn_rate: opts.spawn_rate,
    };
    info!(
        task_id = %config.task_id,
        headers = ?config.masked_headers(),
        stream = config.stream_mode,
        users = config.concurrent_users,
        "run configuration ready"
    );
    Ok(config)
}

/// Run the `generate` subcommand, returning the process exit code.
pub async fn cmd_generate(opts: &GenerateOpts) -> Result<u8> {
    let config = Arc::new(build_run_config(opts)?);
    if opts.worker {
        run_worker(opts, config).await
    } else if opts.processes > 0 {
        run_master_distributed(opts, config).await
    } else {
        run_master_local(config).await
    }
}

/// Single-process mode: virtual users live here, metrics aggregate here.
async fn run_master_local(config: Arc<RunConfig>) -> Result<u8> {
    let prompts = Arc::new(
        PromptSource::load(&config.test_data, config.chat_type)
            .context("failed to load dataset")?,
    );
    let (mut aggregator, sink) = WorkerAggregator::new();
    let ctx = Arc::new(UserContext::new(config.clone(), prompts, sink)?);
    let cancel = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;

    let started = std::time::Instant::now();
    let fleet = tokio::spawn(run_user_fleet(ctx, cancel.clone()));

    tokio::select! {
        _ = tokio::time::sleep(config.duration) => {
            info!("run time elapsed; winding the fleet down");
        }
        _ = sigterm.recv() => {
            info!("received terminate signal; winding the fleet down");
        }
    }
    cancel.cancel();
    let _ = timeout(Duration::from_secs(10), fleet).await;

    aggregator.drain();
    let execution_secs = started.elapsed().as_secs_f64();
    let snapshot = local_snapshot(&config.task_id, &mut aggregator, execution_secs);
    write_snapshot(&config.task_id, &snapshot)?;

    if snapshot.total_failures() > 0 {
        Ok(EXIT_FAILED_REQUESTS)
    } else {
        Ok(EXIT_OK)
    }
}

fn local_snapshot(
    task_id: &str,
    aggregator: &mut WorkerAggregator,
    execution_secs: f64,
) -> RunSnapshot {
    let totals = crate::coordinator::AggregateTotals {
        request_count: aggregator.request_count(),
        completion_tokens: aggregator.completion_tokens(),
        total_tokens: aggregator.total_tokens(),
    };
    RunSnapshot {
        custom_metrics: CustomMetrics::compute(&totals, execution_secs),
        locust_stats: endpoint_rows(task_id, aggregator.stats(), execution_secs),
    }
}

/// Master of a multi-process group: no virtual users here, only worker
/// supervision and metric collection.
async fn run_master_distributed(
    opts: &GenerateOpts,
    config: Arc<RunConfig>,
) -> Result<u8> {
    let mut bus = MasterBus::bind(opts.master_port)
        .await
        .context("failed to bind the coordination channel")?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let binary = std::env::current_exe().context("failed to locate own binary")?;
    let mut workers = Vec::new();
    for index in 0..opts.processes {
        let child = Command::new(&binary)
            .args(worker_args(opts, bus.port()))
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn worker {index}"))?;
        workers.push(child);
    }
    info!(workers = workers.len(), port = bus.port(), "worker group spawned");

    let started = std::time::Instant::now();
    let run_deadline = Instant::now() + config.duration;
    let mut next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;
    let mut state = MasterState::new();
    let mut stopping = false;

    while Instant::now() < run_deadline {
        let step = run_deadline.min(next_heartbeat);
        tokio::select! {
            message = bus.recv_until(step) => {
                if let Some(message) = message {
                    state.handle(message);
                }
            }
            _ = sigterm.recv() => {
                info!("received terminate signal; stopping the group");
                stopping = true;
                break;
            }
        }
        if Instant::now() >= next_heartbeat {
            bus.broadcast(&BusMessage::WorkerHeartbeat);
            next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;
        }
    }

    if stopping {
        // Stops have a hard deadline before the supervisor escalates to
        // SIGKILL, so settle for one quick collection round.
        bus.broadcast(&BusMessage::RequestMetrics);
        let deadline = Instant::now() + Duration::from_secs(2);
        while let Some(message) = bus.recv_until(deadline).await {
            state.handle(message);
        }
    } else {
        collect_final_metrics(&mut bus, &mut state, opts.processes).await;
    }

    let execution_secs = started.elapsed().as_secs_f64();
    let totals = state.aggregate();
    let mut registry = StatsRegistry::new();
    state.merge_stats_into(&mut registry);
    let snapshot = RunSnapshot {
        custom_metrics: CustomMetrics::compute(&totals, execution_secs),
        locust_stats: endpoint_rows(&config.task_id, &registry, execution_secs),
    };
    write_snapshot(&config.task_id, &snapshot)?;

    for mut child in workers {
        match timeout(WORKER_EXIT_WAIT, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("worker did not exit in time; killing it");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }

    if snapshot.total_failures() > 0 {
        Ok(EXIT_FAILED_REQUESTS)
    } else {
        Ok(EXIT_OK)
    }
}

/// The argv of one worker process.
fn worker_args(opts: &GenerateOpts, port: u16) -> Vec<String> {
    let mut args = vec![
        "generate".to_owned(),
        "--worker".to_owned(),
        "--host".to_owned(),
        opts.host.clone(),
        "--users".to_owned(),
        (opts.users / opts.processes.max(1) as u32).max(1).to_string(),
        "--spawn-rate".to_owned(),
        opts.spawn_rate.to_string(),
        "--run-time".to_owned(),
        opts.run_time.clone(),
        "--task-id".to_owned(),
        opts.task_id.clone(),
        "--master-port".to_owned(),
        port.to_string(),
        "--api_path".to_owned(),
        opts.api_path.clone(),
        "--chat_type".to_owned(),
        opts.chat_type.to_string(),
        "--stream_mode".to_owned(),
        opts.stream_mode.clone(),
    ];
    for (flag, value) in [
        ("--headers", &opts.headers),
        ("--cookies", &opts.cookies),
        ("--request_payload", &opts.request_payload),
        ("--model_name", &opts.model_name),
        ("--system_prompt", &opts.system_prompt),
        ("--cert_file", &opts.cert_file),
        ("--key_file", &opts.key_file),
        ("--field_mapping", &opts.field_mapping),
        ("--test_data", &opts.test_data),
    ] {
        if !value.is_empty() {
            args.push(flag.to_owned());
            args.push(value.clone());
        }
    }
    args
}

/// Worker mode: host a share of the virtual users and answer the master.
async fn run_worker(opts: &GenerateOpts, config: Arc<RunConfig>) -> Result<u8> {
    let prompts = Arc::new(
        PromptSource::load(&config.test_data, config.chat_type)
            .context("failed to load dataset")?,
    );
    let (aggregator, sink) = WorkerAggregator::new();
    let aggregator = Arc::new(Mutex::new(aggregator));
    let ctx = Arc::new(UserContext::new(config.clone(), prompts, sink)?);
    let cancel = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;

    let mut bus = connect_with_retry(opts.master_port).await?;
    let worker_id = aggregator
        .lock()
        .expect("lock poisoned")
        .worker_id()
        .to_owned();
    info!(%worker_id, "worker attached to master");

    let fleet = tokio::spawn(run_user_fleet(ctx, cancel.clone()));
    let run_deadline = Instant::now() + config.duration;
    let linger_deadline = run_deadline + WORKER_LINGER;

    loop {
        tokio::select! {
            message = bus.next() => {
                match message {
                    Some(BusMessage::RequestMetrics) => {
                        let snapshot =
                            aggregator.lock().expect("lock poisoned").snapshot();
                        if let Err(err) = bus.send_snapshot(snapshot).await {
                            warn!("giving up on a snapshot delivery: {err}");
                        }
                    }
                    Some(BusMessage::WorkerHeartbeat) => {
                        let _ = bus.send_heartbeat(&worker_id).await;
                    }
                    Some(_) => {}
                    None => {
                        info!("master went away; shutting down");
                        break;
                    }
                }
            }
            _ = sleep_until(run_deadline), if !cancel.is_cancelled() => {
                info!("run time elapsed; winding the fleet down");
                cancel.cancel();
            }
            _ = sleep_until(linger_deadline) => break,
            _ = sigterm.recv() => {
                info!("received terminate signal");
                break;
            }
        }
    }

    cancel.cancel();
    let _ = timeout(Duration::from_secs(10), fleet).await;

    let failures = {
        let mut aggregator = aggregator.lock().expect("lock poisoned");
        aggregator.drain();
        aggregator.stats().total_failures()
    };
    if failures > 0 {
        Ok(EXIT_FAILED_REQUESTS)
    } else {
        Ok(EXIT_OK)
    }
}

async fn connect_with_retry(port: u16) -> Result<WorkerBus> {
    let mut last_err = None;
    for _ in 0..10 {
        match WorkerBus::connect(port).await {
            Ok(bus) => return Ok(bus),
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("could not reach master")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> GenerateOpts {
        GenerateOpts {
            host: "http://localhost:8000".to_owned(),
            users: 2000,
            spawn_rate: 10.0,
            run_time: "30s".to_owned(),
            processes: 4,
            task_id: "task-1".to_owned(),
            master_port: 5557,
            api_path: "/chat/completions".to_owned(),
            headers: String::new(),
            cookies: String::new(),
            request_payload: String::new(),
            model_name: "test-model".to_owned(),
            system_prompt: String::new(),
            stream_mode: "true".to_owned(),
            chat_type: 0,
            cert_file: String::new(),
            key_file: String::new(),
            field_mapping: String::new(),
            test_data: String::new(),
            worker: false,
        }
    }

    #[test]
    fn run_config_parses_flags() {
        let config = build_run_config(&opts()).unwrap();
        assert_eq!(config.task_id, "task-1");
        assert_eq!(config.duration, Duration::from_secs(30));
        assert!(config.stream_mode);
        assert!(config.is_chat_completions());
        assert_eq!(config.headers["Content-Type"], "application/json");
    }

    #[test]
    fn worker_args_split_users_and_mark_worker() {
        let args = worker_args(&opts(), 5600);
        assert!(args.contains(&"--worker".to_owned()));
        let users_at = args.iter().position(|arg| arg == "--users").unwrap();
        assert_eq!(args[users_at + 1], "500");
        let port_at = args.iter().position(|arg| arg == "--master-port").unwrap();
        assert_eq!(args[port_at + 1], "5600");
        // Empty optional flags stay off the command line.
        assert!(!args.contains(&"--request_payload".to_owned()));
    }

    #[test]
    fn bad_run_time_is_rejected() {
        let mut bad = opts();
        bad.run_time = "soon".to_owned();
        assert!(build_run_config(&bad).is_err());
    }
}
