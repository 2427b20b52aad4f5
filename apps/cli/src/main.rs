//! Veil CLI
//!
//! Command-line front end for the Veil onion relay.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use veil_core::Config;
use veil_crypto::Identity;
use veil_relay::Relay;

/// Veil - onion-routing relay
#[derive(Parser)]
#[command(name = "veil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Control-client listener port
    #[arg(long)]
    port: Option<u16>,

    /// Relay-to-relay listener port
    #[arg(long)]
    api_port: Option<u16>,

    /// Interface both listeners bind to
    #[arg(long)]
    hostname: Option<String>,

    /// Path to the hostkey secret file
    #[arg(long)]
    hostkey: Option<PathBuf>,

    /// Minimum number of intermediate hops per tunnel
    #[arg(long, short = 'n')]
    minimum_hops: Option<u8>,

    /// Address of the random peer sampling service
    #[arg(long)]
    rps_addr: Option<String>,

    /// Timeout in seconds for connects and awaited responses
    #[arg(long)]
    timeout: Option<u64>,

    /// Optional JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a fresh hostkey file
    Keygen {
        /// Where to write the key; defaults to the configured hostkey path
        #[arg(long)]
        hostkey: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "info,veil_core=debug,veil_crypto=debug,veil_relay=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn assemble_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(api_port) = cli.api_port {
        config.api_port = api_port;
    }
    if let Some(hostname) = &cli.hostname {
        config.hostname = hostname.clone();
    }
    if let Some(hostkey) = &cli.hostkey {
        config.hostkey = hostkey.clone();
    }
    if let Some(minimum_hops) = cli.minimum_hops {
        config.min_hops = minimum_hops;
    }
    if let Some(rps_addr) = &cli.rps_addr {
        config.rps_addr = rps_addr.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = assemble_config(&cli)?;

    if let Some(Commands::Keygen { hostkey }) = cli.command {
        let path = hostkey.unwrap_or_else(|| config.hostkey.clone());
        let identity = Identity::generate();
        identity
            .save(&path)
            .with_context(|| format!("writing hostkey to {}", path.display()))?;
        println!(
            "{} {}",
            hex::encode(identity.public_key_bytes()),
            path.display()
        );
        return Ok(());
    }

    config.validate().context("invalid configuration")?;
    let identity = Identity::load(&config.hostkey)
        .with_context(|| format!("reading hostkey from {}", config.hostkey.display()))?;
    tracing::info!(
        "Starting relay {}.. with minimum {} hops",
        identity.hostkey().short(),
        config.min_hops
    );

    let mut handle = Relay::new(config, identity)?.start().await?;

    let stopped_on_its_own = tokio::select! {
        _ = handle.wait() => true,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            false
        }
    };
    handle.shutdown();
    if stopped_on_its_own {
        anyhow::bail!("relay listeners stopped unexpectedly");
    }
    Ok(())
}
