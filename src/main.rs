#![forbid(unsafe_code)]

//! `txlock-sim` — run a session script against a shared `SQLite` database
//! and print what each session saw.
//!
//! Results, the timeline and the final lock table go to stdout as JSON
//! lines; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use txlock_sim::engine::sqlite::SqliteConnector;
use txlock_sim::lock_manager::LockSnapshot;
use txlock_sim::models::TimelineEvent;
use txlock_sim::orchestrator::Orchestrator;
use txlock_sim::script::{self, StepReport};
use txlock_sim::{AppError, Result, SimulatorConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "txlock-sim", about = "Row-lock simulator for concurrent SQL sessions", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Script of `<session>: <sql>` lines. Reads stdin when omitted.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Override the database file from the configuration.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Output<'a> {
    Step(&'a StepReport),
    Event(&'a TimelineEvent),
    Locks(&'a LockSnapshot),
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => SimulatorConfig::load_from_path(path)?,
        None => SimulatorConfig::default(),
    };
    if let Some(database) = args.database {
        config.engine.database_path = database;
    }
    info!(database = %config.engine.database_path.display(), "configuration loaded");

    // ── Read script ─────────────────────────────────────
    let text = match &args.script {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|err| AppError::Io(format!("cannot read script: {err}")))?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    let steps = script::parse_script(&text)?;
    info!(steps = steps.len(), "script parsed");

    // ── Start sessions ──────────────────────────────────
    let connector = Arc::new(SqliteConnector::new(&config.engine));
    let orchestrator = Arc::new(Orchestrator::start(&config, connector).await?);

    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_ct.cancel(),
            Err(err) => warn!(%err, "ctrl-c handler unavailable"),
        }
    });

    // ── Run ─────────────────────────────────────────────
    let reports = script::run_script(Arc::clone(&orchestrator), steps, ct).await?;

    for report in &reports {
        emit(&Output::Step(report))?;
    }
    for event in &orchestrator.timeline().entries() {
        emit(&Output::Event(event))?;
    }
    emit(&Output::Locks(&orchestrator.lock_manager().snapshot()))?;

    orchestrator.shutdown().await;
    Ok(())
}

fn emit(output: &Output<'_>) -> Result<()> {
    let line = serde_json::to_string(output)
        .map_err(|err| AppError::Io(format!("failed to encode output: {err}")))?;
    println!("{line}");
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
