// ============================================================================
// File: src/main.rs
// Entry point and CLI handling
// ============================================================================

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use car_advisor::config::Config;
use car_advisor::server::{self, AppState};

/// Command-line arguments for the advisor server
#[derive(Parser, Debug)]
#[command(name = "car-advisor")]
#[command(about = "Serve the car buying advisor API", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose output (pipeline stages and upstream calls)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Secrets usually live in .env during development
    dotenvy::dotenv().ok();

    let default_filter = if args.verbose {
        "car_advisor=debug,tower_http=debug"
    } else {
        "car_advisor=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load(&args.config)?;
    let port = args.port.unwrap_or(config.server.port);

    let state = AppState::from_config(&config)?;
    server::serve(port, state).await?;

    tracing::info!("car-advisor shutdown complete");
    Ok(())
}
