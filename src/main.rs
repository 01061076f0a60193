//! Edge Gateway - Main Entry Point

use clap::{Parser, Subcommand};
use edge_gateway::config::GatewayConfig;
use edge_gateway::observability::logging::{init_default_logging, init_logging, LogFormat};
use edge_gateway::Gateway;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info, warn, Level};

const DEFAULT_CONFIG_PATHS: &[&str] = &["edge-gateway.toml", "config/edge-gateway.toml"];

/// Edge-side MQTT message gateway
#[derive(Parser)]
#[command(name = "edge-gateway")]
#[command(about = "Edge-side MQTT message gateway")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_cli_logging(cli.verbose);

    info!("Starting edge gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    apply_env_overrides(&mut config);

    let result = match cli.command {
        Commands::Run => run_gateway(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_cli_logging(verbose: u8) {
    if verbose == 0 || std::env::var("LOG_LEVEL").is_ok() {
        init_default_logging();
        return;
    }

    let level = if verbose == 1 { Level::DEBUG } else { Level::TRACE };
    let format =
        LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()));
    init_logging(level, format, false);
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(GatewayConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(GatewayConfig::load_from_file(path)?);
        }
    }

    warn!(
        "No configuration file found ({}), using defaults",
        DEFAULT_CONFIG_PATHS.join(", ")
    );
    let config = GatewayConfig::default();
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Some(port) = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
    {
        config.gateway.health_port = port;
    }
}

async fn run_gateway(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        broker = %config.mqtt.broker_url,
        client_id = %config.mqtt.client_id,
        "Gateway starting"
    );

    let mut gateway = Gateway::build(config)?;
    gateway.spawn_health_server();

    // Signal handlers go in before connecting so a slow broker can still be interrupted
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = gateway.start() => result?,
        _ = sigint.recv() => {
            info!("Received SIGINT during startup, shutting down");
            return Ok(gateway.shutdown().await?);
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM during startup, shutting down");
            return Ok(gateway.shutdown().await?);
        }
    }

    info!("Gateway is running, waiting for messages");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    gateway.shutdown().await?;
    Ok(())
}

fn handle_config_command(
    config: &GatewayConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!("Configuration validation complete");
    Ok(())
}
