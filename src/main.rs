mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strand_core::config::{StoreBackend, StrandConfig};
use strand_core::event::EventBus;
use strand_core::flow_data::FlowData;
use strand_core::state::GlobalState;
use strand_core::traits::EventLog;
use strand_core::types::{ExecutionId, RunConfig};
use strand_engine::{DurableEngine, FutureEngine, RunHandle, RunLogger};
use strand_store::open_event_log;

use crate::manifest::Manifest;

#[derive(Parser)]
#[command(name = "strand", version, about = "Durable graph workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strand.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph manifest (JSON or TOML)
    Run {
        manifest: PathBuf,
        /// Initial state as a JSON object, merged over the manifest's input
        #[arg(long)]
        input: Option<String>,
        /// Run configuration as a JSON object
        #[arg(long = "run-config")]
        run_config: Option<String>,
        /// Execution id (generated if not provided)
        #[arg(long)]
        id: Option<String>,
        #[arg(long, value_enum, default_value_t = EngineKind::Durable)]
        engine: EngineKind,
        /// Print progress fragments as they arrive
        #[arg(long)]
        stream: bool,
    },
    /// Recover an interrupted run from the event log and finish it
    Resume {
        manifest: PathBuf,
        execution_id: String,
    },
    /// List runs present in the event log
    Runs,
    /// Print a run's persisted events as JSON lines
    Events { execution_id: String },
    /// Delete a run's events, including its subgraph runs
    Release { execution_id: String },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    Durable,
    Future,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("STRAND_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("strand=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "strand", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            manifest,
            input,
            run_config,
            id,
            engine,
            stream,
        } => {
            let manifest = Manifest::load(&manifest)?;
            let graph = manifest.compile()?;
            let mut state = manifest.input();
            if let Some(raw) = input {
                let value = serde_json::from_str(&raw).context("--input is not valid JSON")?;
                let extra = GlobalState::from_value(value)?;
                state = state.merge(&extra);
            }
            let run_config = match run_config {
                Some(raw) => RunConfig {
                    values: serde_json::from_str(&raw).context("--run-config is not a JSON object")?,
                },
                None => RunConfig::default(),
            };

            let id = match id {
                Some(raw) => ExecutionId::parse(&raw)?,
                None => ExecutionId::new(),
            };

            match engine {
                EngineKind::Durable => {
                    let engine = durable_engine(&config)?;
                    let logger = spawn_run_logger(&config, engine.event_bus(), &id);
                    let handle = engine.start_with_id(id, graph, state, run_config).await?;
                    finish(handle, stream, logger).await
                }
                EngineKind::Future => {
                    let engine = FutureEngine::new().with_settings(config.engine.clone());
                    let logger = spawn_run_logger(&config, engine.event_bus(), &id);
                    let handle = engine.start_with_id(id, graph, state, run_config).await?;
                    finish(handle, stream, logger).await
                }
            }
        }

        Commands::Resume {
            manifest,
            execution_id,
        } => {
            let graph = Manifest::load(&manifest)?.compile()?;
            let engine = durable_engine(&config)?;
            let id = ExecutionId::from_string(&execution_id);
            let logger = spawn_run_logger(&config, engine.event_bus(), &id);
            let handle = engine.recover(graph, &id).await?;
            finish(handle, false, logger).await
        }

        Commands::Runs => {
            let log = event_log(&config)?;
            let engine = DurableEngine::new(log.clone());
            let ids = engine.pending_executions().await?;
            if ids.is_empty() {
                println!("No runs recorded.");
                return Ok(());
            }
            for id in ids {
                let records = log.replay(&id).await?;
                let last = records
                    .last()
                    .map(|r| format!("{} {}", r.event.kind(), r.event.node_id()))
                    .unwrap_or_default();
                println!("{}  events={}  last={}", id, records.len(), last);
            }
            Ok(())
        }

        Commands::Events { execution_id } => {
            let log = event_log(&config)?;
            let records = log.replay(&ExecutionId::from_string(&execution_id)).await?;
            if records.is_empty() {
                anyhow::bail!("no events recorded for {}", execution_id);
            }
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }

        Commands::Release { execution_id } => {
            let engine = durable_engine(&config)?;
            let removed = engine.release(&ExecutionId::from_string(&execution_id)).await?;
            println!("Removed {} events.", removed);
            Ok(())
        }

        Commands::Completions { .. } => Ok(()),
    }
}

/// Load config from the given path, then `~/.strand/config.toml`, falling
/// back to defaults.
fn load_config(path: &Path) -> anyhow::Result<StrandConfig> {
    if path.exists() {
        return Ok(StrandConfig::load(path)?);
    }
    if let Some(home) = dirs_home().map(|h| h.join(".strand").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(StrandConfig::load(&home)?);
        }
    }
    Ok(StrandConfig::default())
}

fn event_log(config: &StrandConfig) -> anyhow::Result<Arc<dyn EventLog>> {
    if config.store.backend == StoreBackend::Memory {
        warn!("Using the in-memory event log; runs will not survive this process");
    }
    Ok(open_event_log(&config.store)?)
}

fn durable_engine(config: &StrandConfig) -> anyhow::Result<DurableEngine> {
    Ok(DurableEngine::new(event_log(config)?).with_settings(config.engine.clone()))
}

fn spawn_run_logger(
    config: &StrandConfig,
    bus: &Arc<EventBus>,
    id: &ExecutionId,
) -> Option<tokio::task::JoinHandle<()>> {
    let log = config.log.as_ref().filter(|l| l.enabled)?;
    let logger = RunLogger::new(log.resolved_dir(), log.level);
    Some(logger.spawn(bus, id.clone(), CancellationToken::new()))
}

/// Drive a run to its terminal signal and print the result.
async fn finish(
    mut handle: RunHandle,
    stream: bool,
    logger: Option<tokio::task::JoinHandle<()>>,
) -> anyhow::Result<()> {
    let id = handle.execution_id().clone();
    let mut outcome = None;
    while let Some(signal) = handle.next().await {
        match signal {
            FlowData::Fragment(fragment) => {
                if stream {
                    println!("{}", serde_json::to_string(&fragment.to_value())?);
                }
            }
            FlowData::Done(state) => outcome = Some(Ok(state)),
            FlowData::Error(cause) => outcome = Some(Err(cause)),
        }
    }

    if let Some(logger) = logger {
        if tokio::time::timeout(Duration::from_secs(2), logger).await.is_err() {
            warn!("Run logger did not finish in time");
        }
    }

    match outcome {
        Some(Ok(state)) => {
            info!(execution_id = %id, "Run completed");
            println!("{}", serde_json::to_string_pretty(&state.to_value())?);
            Ok(())
        }
        Some(Err(cause)) => Err(anyhow::anyhow!(cause).context(format!("run {} failed", id))),
        None => anyhow::bail!("run {} ended without a result", id),
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
