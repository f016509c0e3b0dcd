//! Responder orchestrator - automated incident response for the lab network
//!
//! Tails the IDS alert feed, keeps only new high/critical alerts, asks the
//! planning service for a remediation plan and runs it over SSH on the
//! affected host:
//! - durable dedup state and feed cursor under `OUTPUT_DIR/RUN_ID/`
//! - optional per-target pooling of alert bursts into one session
//! - bounded retries with linear backoff
//! - JSON-lines timeline and execution logs next to the detailed log

mod config;
mod execution;
mod feed;
mod filter;
mod models;
mod orchestrator;
mod planner;
mod pool;
mod state;
mod store;
mod timeline;

use anyhow::{Context, Result};
use config::ResponderConfig;
use execution::ssh::SshTransport;
use feed::AlertFeed;
use orchestrator::{Components, Orchestrator};
use planner::HttpPlanner;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use store::JsonAlertStore;
use timeline::{EventContext, EventLevel, ExecutionLog, Timeline};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[tokio::main]
async fn main() {
    // .env is optional
    dotenvy::dotenv().ok();

    if let Err(e) = run().await {
        eprintln!("[responder] fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = ResponderConfig::load().context("Failed to load configuration")?;
    let run_dir = config.run_dir();
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create output directory {}", run_dir.display()))?;

    let _log_guard = init_tracing(&config)?;
    info!("responder starting, run {} in {}", config.run_id, run_dir.display());

    let store = Arc::new(
        JsonAlertStore::open(config.dedup_state_file()).context("Failed to load dedup state")?,
    );
    let feed = AlertFeed::open(config.alert_file(), Some(config.cursor_file()))
        .await
        .context("Failed to open alert feed")?;
    let timeline = Arc::new(Timeline::open(config.timeline_file()).context("Failed to open timeline log")?);
    let exec_log = Arc::new(
        ExecutionLog::open(config.execution_log_file()).context("Failed to open execution log")?,
    );
    let planner = HttpPlanner::new(&config.planner_url, config.planner_timeout())
        .context("Failed to create planner client")?;
    info!("planner endpoint {}", planner.url());
    let transport = SshTransport::new(config.ssh.clone());

    timeline.event(
        EventLevel::Init,
        &format!(
            "Auto-responder started (multi-alert {}, poll {}s, dedup window {}s)",
            if config.enable_multi_alert { "on" } else { "off" },
            config.poll_interval_secs,
            config.duplicate_window_secs
        ),
        &EventContext::default(),
        Some(json!({
            "config": serde_json::to_value(&config).ok(),
            "alert_file": config.alert_file(),
            "dedup_state": config.dedup_state_file(),
            "timeline": timeline.path(),
            "executions": exec_log.path(),
        })),
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let parts = Components {
        feed,
        store,
        planner: Arc::new(planner),
        transport: Arc::new(transport),
        timeline: timeline.clone(),
        exec_log,
    };
    Orchestrator::new(&config, parts, cancel).run().await;

    info!("responder stopped");
    Ok(())
}

/// Console layer on stderr plus the detailed activity log in the run directory
fn init_tracing(config: &ResponderConfig) -> Result<WorkerGuard> {
    let log_path = config.activity_log_file();
    let log_dir = log_path.parent().map(Path::to_path_buf).unwrap_or_else(|| config.run_dir());
    let log_name = log_path
        .file_name()
        .context("activity log path has no file name")?;
    let file_appender = tracing_appender::rolling::never(log_dir, log_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("responder_orchestrator=info"))
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(default_filter());
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(default_filter());

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                        _ = term.recv() => info!("SIGTERM received"),
                    }
                }
                Err(e) => {
                    error!("failed to install SIGTERM handler: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("SIGINT received");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
            }
        }
        token.cancel();
    });
}
