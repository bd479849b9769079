use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tradegate::api::start_api_server;
use tradegate::config::{Config, LoggingConfig};
use tradegate::rpc::{PoolRegistry, RegistryConfig, TcpDialer};
use tradegate::{GatewayError, Result};

#[cfg(feature = "fast-allocator")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "tradegate")]
#[command(about = "RPC connection pooling for the trading API gateway", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Admin API port (overrides config)
    #[arg(long)]
    api_port: Option<u16>,

    /// Additional upstream address to warm up (repeatable)
    #[arg(long = "upstream", value_name = "ADDR")]
    upstreams: Vec<String>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overrides config
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle config generation
    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!("Edit the file and run: tradegate --config {:?}", config_path);
        return Ok(());
    }

    // Load configuration
    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(port) = args.api_port {
        config.api.bind_port = port;
    }
    config.upstreams.extend(args.upstreams);
    config.validate()?;

    init_logging(&config.logging)?;

    info!("tradegate v{} starting", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Loaded configuration from: {:?}", path),
        None => info!("No configuration file specified, using defaults"),
    }

    let registry = Arc::new(PoolRegistry::new(
        RegistryConfig::new(config.pool.clone(), &config.registry),
        TcpDialer::from(&config.dial),
    ));

    for upstream in &config.upstreams {
        match registry.get_conn(upstream).await {
            Ok(_warm) => info!(upstream = %upstream, "upstream pool ready"),
            Err(e) => warn!(upstream = %upstream, error = %e, "failed to warm up upstream pool"),
        }
    }

    let api = start_api_server(&config.api, registry.clone()).await?;

    info!("Gateway pool service running, press Ctrl+C to stop");

    // Handle Ctrl+C for graceful shutdown
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down gracefully...");

    if let Some(api) = api {
        api.abort();
    }
    registry.close();

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_new(&config.level)
        .map_err(|e| GatewayError::Config(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    Ok(())
}
