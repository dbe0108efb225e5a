//! fleetcheckd — the fleetcheck runner.
//!
//! Each `run` invocation performs exactly one health-check cycle and exits;
//! scheduling is left to cron, a systemd timer, or any other trigger. State
//! carries between invocations only through the redb database.
//!
//! # Usage
//!
//! ```text
//! fleetcheckd --config /etc/fleetcheck/fleetcheck.toml run
//! fleetcheckd --config /etc/fleetcheck/fleetcheck.toml records --group vpc-1
//! fleetcheckd ping 10.0.0.5 22
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetcheck_autoscale::MembershipPublisher;
use fleetcheck_core::{CheckerConfig, InventoryDiscovery, RunOverrides};
use fleetcheck_health::{Coordinator, HealthPublisher, LogPublisher, TcpProber, tcp_probe};
use fleetcheck_state::StateStore;

#[derive(Parser)]
#[command(name = "fleetcheckd", about = "Fleet TCP health checker")]
struct Cli {
    /// Configuration file. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one health-check cycle and print its report.
    Run {
        /// Group to check, overriding the configuration.
        #[arg(long)]
        group: Option<String>,

        /// Consecutive misses tolerated before an instance is unhealthy.
        #[arg(long)]
        max_missed: Option<u64>,

        /// Retention window for stale records, in days.
        #[arg(long)]
        retention_days: Option<u64>,

        /// Log verdicts instead of applying them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Create the health record table if it does not exist.
    Provision,

    /// Print stored health records.
    Records {
        /// Only records in this group.
        #[arg(long)]
        group: Option<String>,
    },

    /// Probe a single endpoint and print the result.
    Ping {
        host: String,
        port: u16,

        #[arg(long, default_value = "3")]
        attempts: u32,

        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            group,
            max_missed,
            retention_days,
            dry_run,
        } => {
            config.apply_overrides(RunOverrides {
                group,
                max_missed,
                retention_days,
                dry_run,
            });
            config.validate()?;
            run_cycle(&config).await
        }
        Command::Provision => {
            let state = open_state(&config)?;
            let outcome = state.provision(config.read_capacity, config.write_capacity)?;
            info!(table = %state.table_name(), ?outcome, "provisioning complete");
            Ok(ExitCode::SUCCESS)
        }
        Command::Records { group } => {
            let state = open_state(&config)?;
            let records: Vec<_> = state
                .list_records()?
                .into_iter()
                .filter(|record| group.as_ref().is_none_or(|g| &record.group == g))
                .collect();
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Ping {
            host,
            port,
            attempts,
            timeout_ms,
        } => {
            let result = tcp_probe(&host, port, attempts, Duration::from_millis(timeout_ms)).await;
            let output = serde_json::json!({
                "address": host,
                "port": port,
                "succeeded": result.succeeded,
                "latency_ms": result.latency.map(|l| l.as_secs_f64() * 1000.0),
                "failure": result.failure,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(if result.succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetcheckd=debug,fleetcheck=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CheckerConfig> {
    match path {
        Some(path) => CheckerConfig::from_file(path),
        None => {
            warn!("no --config given; using built-in defaults");
            Ok(CheckerConfig::default())
        }
    }
}

fn open_state(config: &CheckerConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let db_path = config.database_path();
    let state = StateStore::open(&db_path, &config.table_name)?;
    info!(path = ?db_path, "state store opened");
    Ok(state)
}

/// One cycle. Fails only when discovery fails; per-instance errors are in the report.
async fn run_cycle(config: &CheckerConfig) -> anyhow::Result<ExitCode> {
    let state = open_state(config)?;
    state.provision(config.read_capacity, config.write_capacity)?;

    let publisher: Arc<dyn HealthPublisher> = if config.dry_run {
        Arc::new(LogPublisher)
    } else {
        Arc::new(MembershipPublisher::new(state.clone()))
    };

    let coordinator = Coordinator::from_config(
        config,
        Arc::new(InventoryDiscovery::from_config(config)),
        Arc::new(TcpProber::from_config(config)),
        Arc::new(state),
        publisher,
    );

    let report = coordinator
        .run_cycle()
        .await
        .context("health check cycle aborted")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}
