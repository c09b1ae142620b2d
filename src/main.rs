use std::{process::ExitCode, str::FromStr};

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use llm_meter::{
    cmd::{
        engine::{EngineOpts, cmd_engine},
        generate::{EXIT_EXECUTION_ERROR, GenerateOpts, cmd_generate},
    },
    prelude::*,
};

/// Drive concurrent load against LLM endpoints and report latency,
/// throughput and token economics.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - LLM_METER_DB (optional): Path of the task store database.
  - LLM_METER_LOGS (optional): Directory for engine and per-task logs.
  - MULTIPROCESS_THRESHOLD, MIN_USERS_PER_PROCESS, FORCE_SINGLE_PROCESS:
    Tune when runs are split across worker processes.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the engine daemon: poll for tasks, supervise runs, persist results.
    Engine(EngineOpts),
    /// Run a load-generator process (spawned by the engine's supervisor).
    Generate(GenerateOpts),
}

/// Our entry point. Exit codes matter here: the supervisor reads them
/// back off the `generate` subcommand, so errors map to explicit codes
/// instead of bubbling out of `main`.
#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    init_tracing(&opts);
    debug!("Parsed options: {:?}", opts);

    match &opts.subcmd {
        Cmd::Engine(engine_opts) => match cmd_engine(engine_opts).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("engine failed: {err:#}");
                ExitCode::FAILURE
            }
        },
        Cmd::Generate(generate_opts) => match cmd_generate(generate_opts).await {
            Ok(code) => ExitCode::from(code),
            Err(err) => {
                error!("generation failed: {err:#}");
                ExitCode::from(EXIT_EXECUTION_ERROR)
            }
        },
    }
}

/// Initialize tracing: stderr always, plus a rolling file when running
/// the engine daemon.
fn init_tracing(opts: &Opts) {
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = || {
        EnvFilter::builder()
            .with_default_directive(directive.clone())
            .from_env_lossy()
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter());

    if let Cmd::Engine(engine_opts) = &opts.subcmd {
        let _ = std::fs::create_dir_all(&engine_opts.logs_dir);
        let file_appender =
            tracing_appender::rolling::daily(&engine_opts.logs_dir, "engine.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender)
            .with_filter(env_filter());
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stderr_layer).init();
    }
}
