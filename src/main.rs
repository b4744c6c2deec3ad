//! Chat relay - Entry Point
//!
//! Parses flags, starts the TCP listener and serves connections forever.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_relay::{Args, ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let config = ServerConfig::from(Args::parse());
    info!("Starting chat relay with {:?}", config);

    let server = ChatServer::bind(config).await?;
    server.run().await;

    Ok(())
}
