//! tunwarden CLI - UDP VPN tunnel server
//!
//! Loads an INI-style server configuration, brings up the TUN device and
//! UDP listener, and runs the dataplane until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use tunwarden::error::Result;
use tunwarden::{ServerConfig, TunnelServer};

/// tunwarden - multi-session UDP VPN tunnel server
#[derive(Parser, Debug)]
#[command(name = "tunwarden")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the server configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    tracing::info!("Loading configuration from: {}", args.config.display());
    let config = ServerConfig::from_file(&args.config)?;

    tracing::info!(
        "tunwarden server starting (subnet {}, {} allowed peers)",
        config.interface.subnet,
        config.peers.len()
    );

    let mut server = TunnelServer::new(config).await?;
    server.run().await
}
