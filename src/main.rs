//! WebSocket Chat Relay - Entry Point
//!
//! Starts the TCP listener and the ChatServer broker, accepting connections
//! until Ctrl-C, then shuts the broker down.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chat_relay::{handle_connection, ChatServer, ServerConfig};

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

    let mut config = ServerConfig::from_env()?;

    // Bind address from the command line wins over the environment
    if let Some(addr) = env::args().nth(1) {
        config.addr = addr;
    }

    // Start TCP listener
    let listener = TcpListener::bind(&config.addr).await?;
    info!("WebSocket Chat Relay listening on {}", config.addr);

    let server = Arc::new(ChatServer::with_config(config.clone()));
    info!(
        "ChatServer started with conversations {:?}",
        config.default_conversations
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // Connection accept loop
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let server = server.clone();

                    // Spawn handler task for each connection
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, server).await {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let errors = server
        .shutdown(Some(config.shutdown_notice.as_str()), config.drain_timeout)
        .await;
    for e in &errors {
        warn!("Error while closing connection: {}", e);
    }
    info!("ChatServer stopped");

    Ok(())
}
