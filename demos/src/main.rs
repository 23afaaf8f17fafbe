//! The demo/host binary: a small `clap`-driven CLI that runs a cluster of
//! hosts over the SQLite reference backend with two illustrative handlers,
//! and a one-shot client mode for operators to pause/resume/shut down an
//! already-running cluster.
//!
//! jemalloc as the global allocator, `tracing-appender` daily rolling file
//! logging with an `EnvFilter` default, `clap::Parser` CLI framing, and a
//! fatal-error reporting block on startup failure.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod config;
mod handlers;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use config::DemoConfig;
use handlers::{AddHandler, SleepHandler};
use taskkit::{HostLauncher, HostTuning, Kit, ReExecLauncher};
use taskkit_backend_sqlite::SqliteBackend;
use taskkit_core::HandlerRegistry;

/// The environment variable a re-exec'd host process reads its
/// configuration payload from.
const HOST_PAYLOAD_ENV: &str = "TASKKIT_DEMO_HOST_PAYLOAD";

#[derive(Parser, Debug)]
#[command(name = "taskkit-demo")]
#[command(about = "Demo host binary for the task execution kit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs a cluster of host processes over the config's SQLite backend.
    Run {
        config: PathBuf,
        /// Comma-separated `group=threads` overrides, e.g. `math=4,io=2`.
        #[arg(long = "threads-per-group")]
        threads_per_group: Option<String>,
        /// Skip the durable queue entirely and run one illustrative "add"
        /// task synchronously in this process instead of starting a host.
        #[arg(long)]
        eager: bool,
        #[arg(long, default_value_t = 1)]
        n_procs: usize,
    },
    /// Publishes a `pause` control event against an already-running cluster.
    Pause {
        config: PathBuf,
        #[arg(long)]
        group: Option<String>,
    },
    /// Publishes a `resume` control event against an already-running cluster.
    Resume {
        config: PathBuf,
        #[arg(long)]
        group: Option<String>,
    },
    /// Publishes a `shutdown` control event against an already-running cluster.
    Shutdown {
        config: PathBuf,
        #[arg(long)]
        group: Option<String>,
    },
}

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("./logs", "taskkit-demo.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("taskkit=info,taskkit_demo=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    guard
}

fn parse_threads_per_group(spec: &str) -> Result<HashMap<String, usize>> {
    spec.split(',')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (group, count) = pair
                .split_once('=')
                .with_context(|| format!("invalid group=threads pair {pair:?}"))?;
            let count: usize = count
                .parse()
                .with_context(|| format!("invalid thread count in {pair:?}"))?;
            Ok((group.to_string(), count))
        })
        .collect()
}

fn registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register("demo", "add", AddHandler);
    registry.register("demo", "sleep", SleepHandler);
    Arc::new(registry)
}

fn open_backend(config: &DemoConfig) -> Result<Arc<SqliteBackend>> {
    SqliteBackend::open(
        &config.db_path,
        Duration::from_millis(config.busy_timeout_ms),
        config.result_retention_secs,
    )
    .with_context(|| format!("failed to open SQLite backend at {}", config.db_path))
}

/// Serialized across the re-exec boundary so the child process can
/// rebuild the same `Kit` without re-parsing command-line overrides.
#[derive(serde::Serialize, serde::Deserialize)]
struct HostPayload {
    config_path: PathBuf,
    threads_per_group: HashMap<String, usize>,
}

async fn run_host(payload: HostPayload) -> Result<()> {
    let config = DemoConfig::load(&payload.config_path)?;
    let backend = open_backend(&config)?;
    let kit = Kit::new(backend, registry());
    let tz = config.tz()?;
    let schedule_entries = config.schedule_entries()?;
    let tuning = HostTuning {
        lease_duration_secs: config.lease_duration_secs,
        lease_max_secs: config.lease_max_secs,
        housekeeping_interval_secs: config.housekeeping_interval_secs,
    };
    info!(groups = payload.threads_per_group.len(), "host process starting");
    kit.start_process(&payload.threads_per_group, schedule_entries, tz, tuning).await
}

async fn run_cluster(
    config_path: PathBuf,
    threads_per_group: Option<String>,
    eager: bool,
    n_procs: usize,
) -> Result<()> {
    let config = DemoConfig::load(&config_path)?;
    let overrides = match threads_per_group {
        Some(spec) => parse_threads_per_group(&spec)?,
        None => HashMap::new(),
    };
    let threads = config.threads_per_group(&overrides);

    if eager {
        let backend = open_backend(&config)?;
        let kit = Kit::new(backend, registry());
        let data = serde_json::to_vec(&serde_json::json!({ "a": 2, "b": 3 }))?;
        let outcome = kit
            .initiate_task("demo", "add", data, None, None, true)
            .await
            .context("eager demonstration task failed")?;
        info!(?outcome, "eager demonstration task completed");
        return Ok(());
    }

    let payload = HostPayload {
        config_path: config_path.clone(),
        threads_per_group: threads,
    };
    let payload_json = serde_json::to_string(&payload)?;
    let launcher: Arc<dyn HostLauncher> = Arc::new(ReExecLauncher::new(
        vec!["__run_host".to_string()],
        HOST_PAYLOAD_ENV,
        payload_json,
    )?);

    let backend = open_backend(&config)?;
    let kit = Kit::new(backend, registry());
    info!(n_procs, "supervisor starting");
    kit.start(n_procs, launcher, None).await
}

fn group_set(group: Option<String>) -> Option<HashSet<String>> {
    group.map(|g| HashSet::from([g]))
}

async fn send_control_event(config_path: PathBuf, group: Option<String>, command: &str) -> Result<()> {
    let config = DemoConfig::load(&config_path)?;
    let backend = open_backend(&config)?;
    let kit = Kit::new(backend, registry());
    let groups = group_set(group);
    match command {
        "pause" => kit.send_pause_event(groups).await?,
        "resume" => kit.send_resume_event(groups).await?,
        "shutdown" => kit.send_shutdown_event(groups).await?,
        other => unreachable!("unhandled control command {other:?}"),
    }
    info!(command, "control event published");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logging();

    if let Ok(payload_json) = std::env::var(HOST_PAYLOAD_ENV) {
        let payload: HostPayload =
            serde_json::from_str(&payload_json).context("failed to parse host payload")?;
        if let Err(err) = run_host(payload).await {
            error!(%err, "host process exited with an error");
            return Err(err);
        }
        return Ok(());
    }

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { config, threads_per_group, eager, n_procs } => {
            run_cluster(config, threads_per_group, eager, n_procs).await
        }
        Command::Pause { config, group } => send_control_event(config, group, "pause").await,
        Command::Resume { config, group } => send_control_event(config, group, "resume").await,
        Command::Shutdown { config, group } => send_control_event(config, group, "shutdown").await,
    };

    if let Err(ref err) = result {
        error!(%err, "taskkit-demo exiting with an error");
    }
    result
}
