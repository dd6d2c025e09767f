//! Multi-conversation WebSocket Chat Relay Library
//!
//! A WebSocket chat relay built with tokio-tungstenite. Clients join named
//! conversations, post messages, and receive message and presence events for
//! every conversation they belong to.
//!
//! # Features
//! - Username bound at connect time (`?username=` query parameter)
//! - Conversations created on first join, plus configured defaults
//! - Non-blocking fan-out with per-recipient failure isolation and eviction
//!   of recipients that stop keeping up
//! - Join/leave presence events
//! - In-memory message history with bounded tail queries
//! - Disconnection cleanup across every conversation
//! - Graceful shutdown with an optional notice
//!
//! # Architecture
//! - `ChatServer` is the broker owning the connection and conversation tables
//! - Each connection runs an intake loop in its own task and a writer task
//!   draining its outbound queue into the socket
//! - Mutations of one conversation are serialized by that conversation's lock
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_relay::{ChatServer, handle_connection};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let server = Arc::new(ChatServer::new());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, server.clone()));
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod handler;
pub mod message;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use config::{ConfigError, ServerConfig};
pub use connection::{Connection, Inbound};
pub use conversation::{Conversation, ConversationSnapshot, ConversationSummary};
pub use error::{ChatError, TransportError};
pub use handler::handle_connection;
pub use message::{ChatMessage, ClientMessage, ErrorCode, ServerMessage};
pub use server::{ChatServer, ServerStats};
pub use types::{ConnectionId, ConversationId, Identity};
