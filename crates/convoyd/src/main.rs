//! convoyd — the Convoy controller daemon.
//!
//! Opens the object store, runs the Deployment, StatefulSet and
//! HorizontalAutoscaler controllers against it and serves health and
//! metrics endpoints. With leader election enabled, only the instance
//! holding the lease reconciles; the others wait.
//!
//! The store is a local redb file and redb holds an exclusive lock on it,
//! so one data directory serves exactly one daemon. Starting a second
//! daemon on the same directory fails at `StateStore::open_with`; the
//! lease never sees it.
//!
//! # Usage
//!
//! ```text
//! convoyd run --data-dir /var/lib/convoy --config /etc/convoy/convoyd.toml
//! convoyd check-config /etc/convoy/convoyd.toml
//! ```

mod server;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use convoy_controller::{Controller, ControllerConfig};
use convoy_leader::{LeaderElector, LeaderGate};
use convoy_state::{SharedClock, SharedStore, StateStore, StoreOptions, SystemClock};

#[derive(Parser)]
#[command(name = "convoyd", about = "Convoy controller daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controllers until interrupted.
    Run {
        /// Data directory for the object store.
        #[arg(long, default_value = "/var/lib/convoy")]
        data_dir: PathBuf,

        /// TOML configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Identity used in the leader lease.
        #[arg(long)]
        identity: Option<String>,

        /// Override the configured number of reconcile workers.
        #[arg(long)]
        workers: Option<usize>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            config,
            identity,
            workers,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_deref())?;
            if let Some(workers) = workers {
                config.workers = workers;
                config.validate()?;
            }
            let identity = identity.unwrap_or_else(|| format!("convoyd-{}", std::process::id()));
            run(data_dir, config, identity).await
        }
        Command::CheckConfig { path } => {
            let config = ControllerConfig::from_file(&path)
                .with_context(|| format!("invalid config {}", path.display()))?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,convoyd=debug,convoy=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ControllerConfig> {
    match path {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(ControllerConfig::default()),
    }
}

async fn run(data_dir: PathBuf, config: ControllerConfig, identity: String) -> anyhow::Result<()> {
    info!(%identity, "convoy daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("convoy.redb");

    let clock: SharedClock = Arc::new(SystemClock);
    let mut options = StoreOptions {
        clock: clock.clone(),
        namespace_quota: config.store.namespace_quota,
        ..Default::default()
    };
    if let Some(capacity) = config.store.watch_capacity {
        options.watch_capacity = capacity;
    }
    let state = Arc::new(StateStore::open_with(&db_path, options)?);
    info!(path = ?db_path, "object store opened");
    let store: SharedStore = state.clone();

    let elector = config.leader.enabled.then(|| {
        Arc::new(LeaderElector::new(
            store.clone(),
            clock.clone(),
            identity.as_str(),
            config.leader.lease_name.as_str(),
            config.leader.lease(),
        ))
    });
    let gate = match &elector {
        Some(elector) => elector.gate(),
        None => LeaderGate::always_leading(clock.clone()),
    };

    let controller = Arc::new(Controller::new(
        store,
        state,
        clock,
        gate,
        config.clone(),
    ));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install CTRL+C handler");
            return;
        }
        info!("shutdown signal received");
        let _ = signal_tx.send(true);
    });

    // ── Health and metrics endpoint ────────────────────────────

    let server_handle = match &config.metrics_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr.as_str())
                .await
                .with_context(|| format!("binding metrics endpoint {addr}"))?;
            info!(%addr, "metrics endpoint listening");
            let router = server::build_router(controller.clone());
            let mut server_shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                });
                if let Err(e) = server.await {
                    error!(error = %e, "metrics endpoint failed");
                }
            }))
        }
        None => None,
    };

    // ── Controllers ────────────────────────────────────────────

    let result = match elector {
        Some(elector) => run_elected(elector, controller, shutdown_rx).await,
        None => {
            controller.metrics().set_leading(true);
            controller.run(shutdown_rx).await
        }
    };

    // Controllers may stop on their own; take the endpoint down with them.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }
    info!("convoy daemon stopped");
    result
}

/// Reconcile only while holding the lease. Losing it stops the controllers
/// and the daemon; a restart rejoins the election with a fresh cache.
async fn run_elected(
    elector: Arc<LeaderElector>,
    controller: Arc<Controller>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let running: Arc<Mutex<Option<JoinHandle<anyhow::Result<()>>>>> = Arc::new(Mutex::new(None));

    let started = {
        let controller = controller.clone();
        let running = running.clone();
        move || {
            info!("leading, starting controllers");
            controller.metrics().set_leading(true);
            let handle = tokio::spawn(controller.run(stop_rx));
            *running.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }
    };
    let stopped = {
        let controller = controller.clone();
        move || {
            warn!("no longer leading, stopping controllers");
            controller.metrics().set_leading(false);
            let _ = stop_tx.send(true);
        }
    };

    elector.run(shutdown, started, stopped).await;

    let handle = running.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(handle) = handle {
        handle.await??;
    }
    Ok(())
}
