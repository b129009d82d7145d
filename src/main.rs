//! Bot entry point: `safety_jim [config.toml]`.
//!
//! The token may come from the config file or `DISCORD_TOKEN` (a `.env`
//! file is honoured).

use tracing::error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() {
    // Initialise tracing (respects RUST_LOG env, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenv::dotenv().ok();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    if let Err(e) = safety_jim::run(&path).await {
        error!(path = %path, error = %e, "bot stopped with an error");
        std::process::exit(1);
    }
}
