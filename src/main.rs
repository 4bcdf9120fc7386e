//! Sydpower command line client
//!
//! Operator surface over the library: list devices, read status, send
//! whitelisted commands and watch live telemetry.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use sydpower::api::{CloudApi, HttpCloudApi};
use sydpower::observability::init_default_logging;
use sydpower::pool::{ClientFactory, ConnectionPool, DefaultClientFactory, PoolConfig};
use sydpower::{CommandExecutor, Credential, DeviceClient, Semaphore, SydpowerConfig};
use tokio::signal;
use tracing::{error, info};

/// Consumer key the CLI uses for pooled connections and command locks
const CLI_CONSUMER: &str = "cli";

/// Sydpower / Fossibot power station client
#[derive(Parser)]
#[command(name = "sydpower")]
#[command(about = "Control Sydpower-based power stations through the vendor cloud")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the devices registered to the account
    Devices,
    /// Request settings and print the device snapshot as JSON
    Status {
        /// Device id; defaults to the first device on the account
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Send a whitelisted command, e.g. `REGChargeUpperLimit 85`
    Send {
        #[arg(short, long)]
        device: Option<String>,
        /// Command name
        command: String,
        /// Percentage, amperes or minutes, depending on the command
        value: Option<u16>,
    },
    /// Print telemetry as it arrives
    Listen {
        #[arg(short, long, default_value_t = 30)]
        seconds: u64,
    },
    /// Show token expiry and delete the cached tokens
    ClearCache,
    /// Validate and optionally print the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Devices => list_devices(&config).await,
        Commands::Status { device } => show_status(&config, device).await,
        Commands::Send {
            device,
            command,
            value,
        } => send_command(&config, device, &command, value).await,
        Commands::Listen { seconds } => listen(&config, Duration::from_secs(seconds)).await,
        Commands::ClearCache => clear_cache(&config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> CliResult<SydpowerConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(SydpowerConfig::load_from_file(path)?);
    }

    for path_str in ["sydpower.toml", "config/sydpower.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(SydpowerConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(SydpowerConfig::default())
}

fn build_api(config: &SydpowerConfig) -> CliResult<Arc<dyn CloudApi>> {
    Ok(Arc::new(HttpCloudApi::new(config.api.clone())?))
}

async fn build_client(config: &SydpowerConfig) -> CliResult<(DeviceClient, Credential)> {
    let credential = config.credential()?;
    let factory = DefaultClientFactory::new(config.clone(), build_api(config)?);
    let client = factory.create(&credential).await?;
    Ok((client, credential))
}

fn build_executor(config: &SydpowerConfig) -> CliResult<CommandExecutor> {
    let factory = Arc::new(DefaultClientFactory::new(config.clone(), build_api(config)?));
    let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.pool), factory));
    Ok(CommandExecutor::new(
        pool,
        Semaphore::new(),
        &config.validator,
    ))
}

async fn resolve_device(config: &SydpowerConfig, device: Option<String>) -> CliResult<String> {
    if let Some(device) = device {
        return Ok(sydpower::api::normalize_device_id(&device));
    }

    let (mut client, _) = build_client(config).await?;
    client.authenticate().await?;
    let devices = client.get_devices(false).await?;
    devices
        .first()
        .map(|d| d.device_id.clone())
        .ok_or_else(|| "No devices registered to this account".into())
}

async fn list_devices(config: &SydpowerConfig) -> CliResult<()> {
    let (mut client, _) = build_client(config).await?;
    client.authenticate().await?;

    for device in client.get_devices(true).await? {
        println!("{}\t{}", device.device_id, device.display_name);
    }
    Ok(())
}

async fn show_status(config: &SydpowerConfig, device: Option<String>) -> CliResult<()> {
    let device_id = resolve_device(config, device).await?;
    let executor = build_executor(config)?;
    let credential = config.credential()?;

    let state = executor
        .refresh_status(&credential, CLI_CONSUMER, &device_id)
        .await?;
    executor.pool().reset().await;

    match state {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => return Err(format!("No status received from {device_id}").into()),
    }
    Ok(())
}

async fn send_command(
    config: &SydpowerConfig,
    device: Option<String>,
    command: &str,
    value: Option<u16>,
) -> CliResult<()> {
    let device_id = resolve_device(config, device).await?;
    let executor = build_executor(config)?;
    let credential = config.credential()?;

    let outcome = executor
        .execute(&credential, CLI_CONSUMER, &device_id, command, value)
        .await?;
    executor.pool().reset().await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if outcome.is_success() {
        Ok(())
    } else {
        Err(format!("{command} was not confirmed").into())
    }
}

async fn listen(config: &SydpowerConfig, duration: Duration) -> CliResult<()> {
    let (mut client, _) = build_client(config).await?;
    client.authenticate().await?;
    client.get_devices(false).await?;
    client.connect_mqtt().await?;

    for device_id in client.device_ids() {
        client.request_device_settings(&device_id).await?;
    }

    let deadline = tokio::time::Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, stopping");
                break;
            }
            result = client.listen_for_updates(remaining.min(Duration::from_secs(1))) => {
                if result? > 0 {
                    println!("{}", serde_json::to_string(client.all_device_data())?);
                }
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}

async fn clear_cache(config: &SydpowerConfig) -> CliResult<()> {
    let (mut client, _) = build_client(config).await?;
    println!("{}", client.token_info());
    client.clear_token_cache()?;
    println!("Token cache cleared");
    Ok(())
}

fn handle_config_command(config: &SydpowerConfig, show: bool) -> CliResult<()> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
