// WireGuard Privilege Broker control client

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use wg_broker::{
    broker::{protocol::Call, session_socket_path, BOOTSTRAP_SOCKET},
    client::BrokerClient,
    types::{FirewallConfig, InterfaceConfig},
};

#[derive(Parser)]
#[command(name = "wg-broker-ctl")]
#[command(about = "Control client for the wg-broker daemon", long_about = None)]
struct Cli {
    /// Broker runtime directory
    #[arg(long, default_value = "/run/wg-broker")]
    runtime_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the broker answers
    Ping,

    /// Bring a tunnel up from a JSON interface config
    Up {
        /// File holding the interface config
        config: PathBuf,
    },

    /// Tear a tunnel down
    Down { interface: String },

    /// Show peer counters of a tunnel
    Status { interface: String },

    /// Enable the kill switch from a JSON firewall config
    KillSwitchOn { config: PathBuf },

    /// Disable the kill switch
    KillSwitchOff,

    /// Flush the system DNS cache
    FlushDns,

    /// List TUN/TAP adapters
    TapList,

    /// Turn daemon logging on or off
    Logs {
        #[arg(value_parser = ["on", "off", "clear"])]
        action: String,
    },

    /// Issue any call given as `{"method": ..., "params": ...}`
    Call { json: String },

    /// Print backend failure events until interrupted
    Watch,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Ask the bootstrap endpoint for a session and connect to it
async fn open_session(runtime_dir: &Path) -> Result<BrokerClient> {
    let mut bootstrap = BrokerClient::connect(runtime_dir.join(BOOTSTRAP_SOCKET)).await?;
    let id = bootstrap.create_session().await;
    let id = u32::try_from(id).map_err(|_| anyhow::anyhow!("Broker refused to create a session"))?;
    let session = BrokerClient::connect(session_socket_path(runtime_dir, id)).await?;
    Ok(session)
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let call = match cli.command {
        Commands::Ping => {
            let mut bootstrap =
                BrokerClient::connect(cli.runtime_dir.join(BOOTSTRAP_SOCKET)).await?;
            return print(&bootstrap.call_raw(Call::Ping).await?);
        }
        Commands::Watch => {
            let mut session = open_session(&cli.runtime_dir).await?;
            loop {
                let event = session.next_event().await?;
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Commands::Up { config } => Call::AddInterface {
            config: read_json::<InterfaceConfig>(&config)?,
        },
        Commands::Down { interface } => Call::DeleteInterface { interface },
        Commands::Status { interface } => Call::GetPeerStatus { interface },
        Commands::KillSwitchOn { config } => Call::EnableKillSwitch {
            config: read_json::<FirewallConfig>(&config)?,
        },
        Commands::KillSwitchOff => Call::DisableKillSwitch,
        Commands::FlushDns => Call::FlushDns,
        Commands::TapList => Call::GetTapList,
        Commands::Logs { action } => match action.as_str() {
            "on" => Call::SetLogsEnabled { enabled: true },
            "off" => Call::SetLogsEnabled { enabled: false },
            _ => Call::ClearLogs,
        },
        Commands::Call { json } => serde_json::from_str(&json).context("Invalid call")?,
    };

    let mut session = open_session(&cli.runtime_dir).await?;
    let reply = session.call_raw(call).await?;
    print(&reply)
}
