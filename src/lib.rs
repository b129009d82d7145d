//! A sharded Discord moderation bot runtime.
//!
//! [`bot::Runtime`] opens one connection per shard through a
//! [`transport::Transport`] and feeds every shard's events into a shared
//! [`bot::Bot`], which resolves prefixed commands and runs the processor
//! chains. The Discord gateway and REST plumbing behind the transport traits
//! is only compiled with the `io` feature.

pub mod bot;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod notifier;
pub mod processors;
pub mod shard;
pub mod transport;
pub mod types;

#[cfg(feature = "io")]
pub mod gateway;
#[cfg(feature = "io")]
pub mod http;

#[cfg(test)]
pub(crate) mod testing;

pub use bot::{Bot, Registry, Runtime};
pub use config::RuntimeConfig;
pub use error::{Error, Result};

/// Load the config at `path`, start every shard against Discord and run
/// until Ctrl-C, then shut down.
#[cfg(feature = "io")]
pub async fn run(path: impl AsRef<std::path::Path>) -> Result<()> {
    use tracing::{info, warn};

    let config = RuntimeConfig::load(path)?;
    info!(?config, "configuration loaded");

    let transport = transport::discord::DiscordTransport::new(config.token.clone());
    let registry = Registry::standard(&config);
    let mut runtime = Runtime::start(config, &transport, registry).await?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(e) => warn!(error = %e, "failed to listen for Ctrl-C, shutting down"),
    }

    runtime.shutdown().await;
    Ok(())
}
