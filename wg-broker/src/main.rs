// WireGuard Privilege Broker Daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use wg_broker::{
    broker::{services::PrivilegedServices, Broker},
    config::load_config,
    dns::ResolvedDns,
    firewall::{select_filter, FirewallEngine},
    logging,
    route_manager::IpRouteTable,
    tunnel_service::WgQuickBackend,
    wg_controller::{ControllerContext, ControllerSettings},
};

/// Size of the backend failure broadcast buffer
const EVENT_CHANNEL_SIZE: usize = 32;

#[derive(Parser)]
#[command(name = "wg-broker")]
#[command(about = "Privileged WireGuard tunnel broker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wg-broker/config.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    // Calls are served one at a time per session; 2 workers cover the
    // accept loop, session tasks and child process IO
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wg-broker")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let logs = logging::init(&config.general.log_level, config.general.log_file.as_deref())
        .context("Failed to initialise logging")?;

    log::info!("Starting wg-broker daemon");
    log::info!("Runtime directory: {}", config.general.runtime_dir.display());

    std::fs::create_dir_all(&config.general.runtime_dir).with_context(|| {
        format!(
            "Failed to create runtime dir {}",
            config.general.runtime_dir.display()
        )
    })?;

    let filter = select_filter(config.firewall.backend);
    log::info!("Packet filter backend: {}", filter.name());

    let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
    let ctx = ControllerContext {
        backend: Arc::new(WgQuickBackend::new(
            &config.backend,
            &config.general.runtime_dir,
        )),
        routes: Arc::new(IpRouteTable),
        firewall: FirewallEngine::shared(filter),
        events,
        settings: ControllerSettings::from(&config.backend),
    };
    let services = Arc::new(PrivilegedServices::new(
        ctx,
        Arc::new(ResolvedDns),
        logs,
    ));
    let broker = Arc::new(Broker::new(config.general.runtime_dir.clone(), services));

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
            _ = sigint.recv() => log::info!("Received SIGINT"),
        }
        log::info!("Shutting down gracefully...");
    };

    broker.serve(shutdown).await?;

    log::info!("Shutdown complete");
    Ok(())
}
