//! The `engine` subcommand: the long-running daemon.
//!
//! Reconciles stale tasks left over from a previous instance, then runs
//! the create and stop pollers plus the orphan reaper until interrupted.

use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::{
    dispatcher::Dispatcher, prelude::*, store::TaskStore, supervisor::Supervisor,
};

/// Engine command line arguments.
#[derive(Debug, Args)]
pub struct EngineOpts {
    /// Path of the task store database.
    #[clap(long, default_value = "llm_meter.db", env = "LLM_METER_DB")]
    pub database: PathBuf,

    /// Directory for the engine log and per-task logs.
    #[clap(long = "logs-dir", default_value = "logs", env = "LLM_METER_LOGS")]
    pub logs_dir: PathBuf,
}

/// Run the `engine` subcommand until interrupted.
pub async fn cmd_engine(opts: &EngineOpts) -> Result<()> {
    std::fs::create_dir_all(&opts.logs_dir)
        .with_context(|| format!("failed to create logs dir {:?}", opts.logs_dir))?;

    let store = Arc::new(TaskStore::open(&opts.database)?);
    let supervisor = Arc::new(Supervisor::new(opts.logs_dir.clone()));

    // Resolve whatever a previous engine instance left behind before
    // accepting new work.
    supervisor.reconcile_on_startup(&store)?;

    let dispatcher = Arc::new(Dispatcher::new(store.clone(), supervisor.clone()));
    let cancel = CancellationToken::new();

    let create_loop = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run_create_loop(cancel).await })
    };
    let stop_loop = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run_stop_loop(cancel).await })
    };
    let reaper = tokio::spawn(
        supervisor
            .clone()
            .run_orphan_reaper(store.clone(), cancel.clone()),
    );

    info!("engine started; waiting for tasks");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();

    let _ = create_loop.await;
    let _ = stop_loop.await;
    let _ = reaper.await;
    Ok(())
}
