//! exec-agent: remote execution agent.
//!
//! Serves JSON-RPC 2.0 over WebSocket: clients start and supervise
//! processes and receive their output as events.
//!
//! Usage:
//!   exec-agent                                   # Default port 4412
//!   exec-agent --port 0                          # OS-assigned port
//!   exec-agent --overflow-policy disconnect      # Drop slow event consumers
//!   exec-agent --log-file                        # Log to ~/.exec-agent/logs/agent.log

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use exec_server::{ConnectionHub, EventBus, HubConfig, OverflowPolicy, Router};
use exec_services::process::{
    GetLogs, GetProcess, GetProcesses, KillProcess, ProcessRegistry, RetentionLimits, StartProcess,
    WaitProcess,
};
use exec_transport::{TransportConfig, TransportServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "exec-agent", about = "Remote execution agent (JSON-RPC over WebSocket)")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "4412")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Maximum concurrent connections
    #[arg(long, default_value = "64")]
    max_connections: usize,

    /// Outbound queue capacity per connection, in frames
    #[arg(long, default_value = "256")]
    queue_capacity: usize,

    /// What to do when a connection's event queue is full (drop-event, disconnect)
    #[arg(long, default_value = "drop-event")]
    overflow_policy: OverflowPolicy,

    /// Output lines kept per process
    #[arg(long, default_value = "10000")]
    max_log_lines: usize,

    /// Exited processes kept for inspection
    #[arg(long, default_value = "100")]
    max_exited_processes: usize,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.exec-agent/logs/agent.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let Some(log_file_arg) = &cli.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    };

    let log_path = if log_file_arg == "DEFAULT" {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".exec-agent/logs/agent.log")
    } else {
        PathBuf::from(log_file_arg)
    };
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();

    eprintln!("Logging to {}", log_path.display());
    Ok(())
}

fn build_router(registry: &Arc<ProcessRegistry>) -> anyhow::Result<Router> {
    let mut router = Router::new();
    router.register(StartProcess::new(registry.clone()))?;
    router.register(KillProcess::new(registry.clone()))?;
    router.register(GetProcess::new(registry.clone()))?;
    router.register(GetProcesses::new(registry.clone()))?;
    router.register(GetLogs::new(registry.clone()))?;
    router.register(WaitProcess::new(registry.clone()))?;
    Ok(router)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let bus = Arc::new(EventBus::new(cli.overflow_policy));
    let registry = Arc::new(ProcessRegistry::with_limits(
        bus.publisher(),
        RetentionLimits {
            max_log_lines: cli.max_log_lines,
            max_exited: cli.max_exited_processes,
        },
    ));
    let router = Arc::new(build_router(&registry).context("Failed to register handlers")?);

    let hub = Arc::new(ConnectionHub::new(
        router,
        bus,
        HubConfig {
            queue_capacity: cli.queue_capacity,
        },
    ));

    let transport_config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        max_connections: Some(cli.max_connections),
    };
    let mut transport = TransportServer::start(transport_config, hub.clone())
        .await
        .context("Failed to start transport")?;

    println!();
    println!("  exec-agent {}", env!("CARGO_PKG_VERSION"));
    println!("  WebSocket:  ws://{}:{}/connect", cli.hostname, transport.port());
    println!("  Health:     http://{}:{}/health", cli.hostname, transport.port());
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    hub.shutdown();
    transport.stop().await;
    registry.shutdown();
    println!("  Agent stopped.");
    Ok(())
}
