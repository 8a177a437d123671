//! GOConnect agent
//!
//! Long-lived process that owns the virtual interface, keeps encrypted
//! sessions to peers and forwards overlay traffic between them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use goconnect_core::{Agent, Settings};
use goconnect_identity::IdentityStore;
use goconnect_network::stun::probe_first;
use goconnect_network::tun::{create_device, StubDevice};

/// GOConnect - peer-to-peer overlay networking agent
#[derive(Parser)]
#[command(name = "goconnect-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.goconnect/config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground
    Start {
        /// Use the stub interface even where a TUN driver exists
        #[arg(long)]
        stub_interface: bool,
    },

    /// Probe the configured STUN servers and print the public endpoint
    Stun {
        /// Query this server instead of the configured list
        server: Option<String>,
    },

    /// Create or refresh the agent identity
    Init,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config_path = expand_path(&cli.config)?;

    match cli.command {
        Commands::Start { stub_interface } => cmd_start(config_path, stub_interface).await,
        Commands::Stun { server } => cmd_stun(config_path, server).await,
        Commands::Init => cmd_init(config_path).await,
        Commands::Config => cmd_config(config_path).await,
    }
}

async fn cmd_start(config_path: PathBuf, stub_interface: bool) -> Result<()> {
    let mut settings = Settings::load_or_create(&config_path).await?;
    settings.secrets_dir = resolve_secrets_dir(&config_path, &settings);
    settings.validate()?;

    let device = if stub_interface {
        Arc::new(StubDevice::new()) as Arc<dyn goconnect_network::tun::Device>
    } else {
        create_device(settings.mtu)
    };

    let agent = Agent::new(settings, device);
    agent.set_endpoint_callback(Arc::new(|endpoint: &str| {
        if endpoint.is_empty() {
            info!("public endpoint lost");
        } else {
            info!("public endpoint {}", endpoint);
        }
    }));

    agent.start().await.context("agent start failed")?;
    info!("agent running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    agent.stop().await?;
    Ok(())
}

async fn cmd_stun(config_path: PathBuf, server: Option<String>) -> Result<()> {
    let servers = match server {
        Some(server) => vec![server],
        None => Settings::load_or_create(&config_path).await?.stun_servers,
    };

    let endpoint = probe_first(&servers).await?;
    println!("{endpoint}");
    Ok(())
}

async fn cmd_init(config_path: PathBuf) -> Result<()> {
    let settings = Settings::load_or_create(&config_path).await?;
    let secrets_dir = resolve_secrets_dir(&config_path, &settings);

    let identity = IdentityStore::new(&secrets_dir).load_or_create()?;
    println!("identity ready under {}", secrets_dir.display());
    println!("ca:\n{}", identity.ca_pem());
    Ok(())
}

async fn cmd_config(config_path: PathBuf) -> Result<()> {
    let settings = Settings::load_or_create(&config_path).await?;
    println!("{}", toml::to_string_pretty(&settings)?);
    Ok(())
}

fn resolve_secrets_dir(config_path: &PathBuf, settings: &Settings) -> PathBuf {
    if settings.secrets_dir.is_absolute() {
        settings.secrets_dir.clone()
    } else {
        config_path
            .parent()
            .map(|dir| dir.join(&settings.secrets_dir))
            .unwrap_or_else(|| settings.secrets_dir.clone())
    }
}

fn expand_path(path: &PathBuf) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("Failed to get home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.clone())
    }
}
