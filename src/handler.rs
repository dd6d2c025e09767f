//! WebSocket connection handler
//!
//! Transport adapter between raw TCP connections and the `ChatServer`:
//! performs the WebSocket handshake, resolves the client's identity from
//! the `username` query parameter, and hands the stream to the broker.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::debug;

use crate::error::ChatError;
use crate::server::ChatServer;
use crate::types::Identity;

/// Handle a new TCP connection
///
/// Returns once the client disconnects and the broker has torn the
/// connection down.
pub async fn handle_connection(stream: TcpStream, server: Arc<ChatServer>) -> Result<(), ChatError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake, capturing the requested username
    let mut requested = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        requested = username_from_query(request.uri().query());
        Ok(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let identity = requested.map(Identity).unwrap_or_else(Identity::anonymous);
    debug!("{} resolved as {}", peer_addr, identity);

    server.accept(identity, ws_stream).await;
    Ok(())
}

/// Extract a non-empty `username` value from a query string
///
/// The reserved `_system` name is refused, so such a client connects
/// anonymously.
pub fn username_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "username")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty() && !Identity::is_reserved(value))
}
