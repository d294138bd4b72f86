//! tabwire -- standalone launcher for the extension CDP relay.

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Run a Chrome extension CDP relay until interrupted.
#[derive(Parser, Debug)]
#[command(name = "tabwire", version, about)]
struct Cli {
    /// CDP URL the relay binds and is keyed by
    #[arg(long, default_value = "http://127.0.0.1:9222")]
    url: String,

    /// Increase logging verbosity (RUST_LOG=debug)
    #[arg(long, short)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, short)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --verbose sets debug, --quiet sets error, otherwise respect RUST_LOG.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let relay = tabwire_relay::ensure_relay(&cli.url).await?;
    if !cli.quiet {
        println!("relay listening on {}", relay.http_base());
        println!("point the extension at {}/extension", relay.http_base().replacen("http", "ws", 1));
        println!("CDP endpoint: {}", relay.cdp_ws_url());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, stopping relay");
    tabwire_relay::stop_relay(&cli.url).await?;

    Ok(())
}
