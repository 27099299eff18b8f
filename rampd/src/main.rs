//! Ramp - rollout control daemon
//!
//! The daemon owns the flag store, drives health-gated percentage ramps,
//! and answers evaluation and administrative requests over the Unix
//! socket API.

#![forbid(unsafe_code)]

mod admin;
mod api;
mod audit;
mod evaluate;
mod http_api;
mod metrics;
mod monitor;
mod rollout;
mod store;

#[cfg(test)]
mod lifecycle_tests;

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UnixListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use admin::AdminService;
use api::DaemonContext;
use audit::AuditLog;
use evaluate::Evaluator;
use monitor::{FileMetricsFeed, HealthMonitor, MonitorSettings};
use ramp_common::config::RampConfig;
use rollout::TransitionEngine;
use store::FlagStore;

#[derive(Parser)]
#[command(name = "rampd")]
#[command(author, version, about = "Ramp daemon - progressive rollout control")]
struct Cli {
    /// Path to the daemon configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to Unix socket (overrides config)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Data directory for flag and audit persistence
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first so its log level can seed the filter.
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_path().unwrap_or_else(|| PathBuf::from("rampd.toml")));
    let config = RampConfig::load(&config_path)?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.clone()))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Starting Ramp daemon...");
    for warning in config.validation_warnings() {
        warn!("Config: {}", warning);
    }

    // Resolve persistence locations.
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(default_data_dir)
        .context("no data directory available; pass --data-dir")?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let flags_path = data_dir.join("flags.json");
    let audit_path = data_dir.join("audit.jsonl");

    // Flag store: reload the snapshot when one exists.
    let store = if flags_path.exists() {
        match FlagStore::load_from_file(&flags_path) {
            Ok(store) => {
                info!("Loaded {} flags from {}", store.len(), flags_path.display());
                Arc::new(store)
            }
            Err(e) => {
                warn!("Failed to load flag store from {}: {}", flags_path.display(), e);
                Arc::new(FlagStore::new().with_persistence(flags_path.clone()))
            }
        }
    } else {
        info!("Creating new flag store at {}", flags_path.display());
        Arc::new(FlagStore::new().with_persistence(flags_path.clone()))
    };

    // Audit log: rehydrate the in-memory ring from the JSONL trail.
    let audit = if audit_path.exists() {
        match AuditLog::load_from_file(&audit_path, config.audit.capacity) {
            Ok(log) => {
                info!("Loaded {} audit records from {}", log.len(), audit_path.display());
                Arc::new(log)
            }
            Err(e) => {
                warn!("Failed to load audit log from {}: {}", audit_path.display(), e);
                Arc::new(AuditLog::new(config.audit.capacity).with_persistence(audit_path.clone()))
            }
        }
    } else {
        Arc::new(AuditLog::new(config.audit.capacity).with_persistence(audit_path.clone()))
    };

    let engine = Arc::new(TransitionEngine::new(
        store.clone(),
        audit.clone(),
        config.schedule.ramp_schedule(),
    ));

    // Health monitor over the configured metrics feed.
    let settings = MonitorSettings {
        check_interval: config.monitor.check_interval(),
        error_rate_multiplier: config.monitor.error_rate_multiplier,
        latency_increase: config.monitor.latency_increase,
        min_consecutive_breaches: config.monitor.min_consecutive_breaches,
        min_observation: config.schedule.min_observation(),
        environment: config.general.environment.clone(),
    };
    let feed = Arc::new(FileMetricsFeed::new(PathBuf::from(
        &config.monitor.samples_path,
    )));
    let health_monitor = HealthMonitor::new(store.clone(), engine.clone(), feed, settings);
    let monitor_degraded = health_monitor.degraded_handle();
    let _monitor_handle = health_monitor.start();
    info!(
        "Health monitor started (interval: {})",
        humantime::format_duration(config.monitor.check_interval())
    );

    // Observability HTTP server.
    if config.general.http_port != 0 {
        let _http_handle = http_api::start_server(
            config.general.http_port,
            http_api::HttpState {
                store: store.clone(),
                monitor_degraded: monitor_degraded.clone(),
                version: env!("CARGO_PKG_VERSION"),
                started_at: Instant::now(),
                pid: std::process::id(),
            },
        )
        .await;
    }

    // Unix socket listener.
    let socket_path = cli
        .socket
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.general.socket_path));
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    info!("Listening on {:?}", socket_path);

    let context = DaemonContext {
        evaluator: Evaluator::new(store.clone())
            .with_read_timeout(config.general.evaluation_read_timeout()),
        admin: Arc::new(AdminService::new(
            store.clone(),
            engine,
            config.general.environment.clone(),
        )),
        store,
        audit,
        monitor_degraded,
        environment: config.general.environment.clone(),
        started_at: Instant::now(),
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
    };

    // Main accept loop.
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let ctx = context.clone();
                tokio::spawn(async move {
                    if let Err(e) = api::handle_connection(stream, ctx).await {
                        warn!("Connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept error: {}", e);
            }
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("rs", "ramp", "rampd")
        .map(|dirs| dirs.config_dir().join("rampd.toml"))
}

fn default_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("rs", "ramp", "rampd").map(|dirs| dirs.data_dir().to_path_buf())
}
