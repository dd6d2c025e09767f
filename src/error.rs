//! Error types for the chat relay
//!
//! Defines relay-level errors and per-connection transport errors.
//! Uses thiserror for ergonomic error definitions.

use std::time::Duration;

use thiserror::Error;

use crate::types::ConversationId;

/// Relay-level errors
///
/// Covers both fatal errors (connection termination) and
/// request errors (reported back to the requesting client).
#[derive(Debug, Error)]
pub enum ChatError {
    /// Unparseable frame from a client (fatal for that connection)
    #[error("Protocol error: {reason} (payload: {payload})")]
    Protocol { payload: String, reason: String },

    /// Read or write failure on one connection (fatal for that connection)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Post to a conversation that was never registered
    #[error("Conversation not found: {0}")]
    UnknownConversation(ConversationId),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(TransportError::WebSocket(err))
    }
}

/// Transport errors for a single connection
///
/// A recipient that fails with one of these is unreachable; the failure
/// never spreads to other recipients.
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket protocol or IO failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The connection was closed or its writer has stopped
    #[error("Connection closed")]
    Closed,

    /// The outbound queue was full; the connection is evicted
    #[error("Outbound queue full")]
    QueueFull,

    /// A socket write or the writer shutdown exceeded the send timeout
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// The connection writer task panicked or was aborted
    #[error("Writer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
