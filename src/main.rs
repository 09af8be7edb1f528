use clap::Parser;
use tracing_subscriber::EnvFilter;

use chat_relay::cli::Args;
use chat_relay::config::RelayConfig;
use chat_relay::web;

/// `RUST_LOG` wins over `--log-level` when both are set.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = RelayConfig::load(&args)?;
    web::serve(config).await?;

    Ok(())
}
