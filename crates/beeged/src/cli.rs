//! Command line entry point for the `beeged` binary.
//!
//! # Usage
//!
//! ```bash
//! # Start a controller that joins an existing cluster
//! beeged controller --cluster-address 10.0.0.2:9001 \
//!     --service-address 10.0.0.2:8080 --join 10.0.0.1:9001
//!
//! # Start a docker node in the background
//! beeged docker -d --cluster-address 10.0.0.5:7000 --join 10.0.0.1:9001
//!
//! # Settings from a file, flags override
//! BEEGE_CONFIG=/etc/beege.toml beeged docker
//!
//! # Stop the daemon / check on it
//! beeged stop
//! beeged status
//!
//! # Enable debug logging
//! RUST_LOG=beeged=debug beeged controller ...
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use beege_core::Role;

use crate::config::ClusterConfig;
use crate::engine::BollardEngine;
use crate::membership::{start_controller, start_docker, NodeContext};
use crate::server::Listener;

/// beege daemon - controller/docker cluster membership
#[derive(Parser, Debug)]
#[command(name = "beeged", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a controller node
    Controller {
        #[command(flatten)]
        node: NodeArgs,

        /// Controller service endpoint
        #[arg(long)]
        service_address: Option<String>,
    },
    /// Run a docker node
    Docker {
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// Address advertised to the cluster (controllers also listen on it)
    #[arg(long)]
    cluster_address: Option<String>,

    /// Controller to join through
    #[arg(long = "join")]
    join_address: Option<String>,

    /// TOML config file (defaults to $BEEGE_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run as a background daemon (fork to background)
    #[arg(short = 'd', long)]
    daemon: bool,
}

impl NodeArgs {
    /// Loads the config file and applies the flags on top.
    fn into_config(self, role: Role, service_address: Option<String>) -> Result<ClusterConfig> {
        let mut config = match &self.config {
            Some(path) => ClusterConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ClusterConfig::from_env().context("Failed to load config")?,
        };

        config.role = Some(role);
        if self.cluster_address.is_some() {
            config.cluster_address = self.cluster_address;
        }
        if self.join_address.is_some() {
            config.join_address = self.join_address;
        }
        if service_address.is_some() {
            config.service_address = service_address;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("beege")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("beeged.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("beeged.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        // Stale PID file
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

/// Parses the command line and runs the selected command.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Controller {
            node,
            service_address,
        } => {
            let daemon = node.daemon;
            let config = node.into_config(Role::Controller, service_address)?;
            start(config, daemon)
        }
        Command::Docker { node } => {
            let daemon = node.daemon;
            let config = node.into_config(Role::Docker, None)?;
            start(config, daemon)
        }
        Command::Stop => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                return Ok(());
            };

            println!("Stopping daemon (PID {pid})...");
            stop_daemon(pid)?;

            for _ in 0..50 {
                if !is_process_running(pid) {
                    println!("Daemon stopped.");
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }

            eprintln!("Daemon did not stop within 5 seconds.");
            process::exit(1);
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                println!("Log: {}", log_file_path().display());
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn start(config: ClusterConfig, daemon: bool) -> Result<()> {
    if let Some(pid) = is_daemon_running() {
        eprintln!("Daemon is already running (PID {pid})");
        eprintln!("Use 'beeged stop' to stop it first.");
        process::exit(1);
    }

    if daemon {
        // Fork before the tokio runtime exists
        daemonize()?;
    }

    write_pid()?;
    let result = run_daemon(config);
    remove_pid_file();

    result
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: ClusterConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("beeged=info".parse()?)
                .add_directive("beege_core=info".parse()?)
                .add_directive("beege_protocol=info".parse()?),
        )
        .init();

    let role = config.validate()?;
    let address = config
        .cluster_address
        .clone()
        .context("cluster_address is required")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        role = %role,
        address = %address,
        "beege daemon starting"
    );

    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    let node = NodeContext::new(role, address.clone(), config.settings())?;

    match role {
        Role::Controller => {
            let listener = Listener::bind(&address).await?;
            let controller =
                start_controller(node, config.join_address.clone(), listener, cancel.clone()).await?;

            if let Some(report) = &controller.discovery {
                info!(
                    discovered = report.discovered.len(),
                    failed = report.failed.len(),
                    "Initial controller discovery complete"
                );
            }
            if let Some(service) = &config.service_address {
                info!(service = %service, "Service address configured");
            }
        }
        Role::Docker => {
            let join = config
                .join_address
                .clone()
                .context("join_address is required")?;
            let engine = BollardEngine::connect_local().context("Failed to connect to docker")?;

            let docker = start_docker(node, join, Arc::new(engine), cancel.clone()).await?;
            info!(controllers = docker.connected, "Initial controller connections made");
        }
    }

    cancel.cancelled().await;

    info!("beege daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
