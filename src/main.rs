use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use stargate_client::ResultTable;
use stargate_smoke::{SmokeConfig, run_smoke};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stargate-smoke")]
#[command(about = "Start Cassandra and Stargate, then query system.local through gRPC")]
#[command(version)]
struct Cli {
    #[arg(long, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    quiet: bool,
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            SmokeConfig::load_from_path(path)
        }
        None => SmokeConfig::load(),
    }
    .context("Failed to load configuration")?;

    let result_set = run_smoke(&config).await.context("Smoke check failed")?;
    println!("{}", ResultTable(&result_set));
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        for cause in e.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
        std::process::exit(1);
    }
}
