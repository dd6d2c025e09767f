//! ChatServer broker implementation
//!
//! The central registry that owns every connection and conversation and
//! routes events between them.
//!
//! State lives behind two async read/write locks (connection table and
//! conversation table) plus one mutex per conversation. Every
//! conversation-mutating operation holds that conversation's mutex while it
//! changes membership or history and enqueues the resulting events, so a
//! recipient sees one conversation's events in processing order. Enqueueing
//! never waits: a recipient whose queue is full is evicted instead. The
//! connection table lock is never held while waiting for a conversation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::conversation::{Conversation, ConversationSnapshot, ConversationSummary};
use crate::error::ChatError;
use crate::message::{ChatMessage, ClientMessage, ServerMessage};
use crate::types::{ConversationId, Identity};

type SharedConversation = Arc<Mutex<Conversation>>;

/// The chat broker
///
/// Construct once at startup, share through `Arc` with the transport
/// adapter, and call [`ChatServer::shutdown`] at teardown.
pub struct ChatServer {
    /// Live connections: Identity -> Connection
    connections: RwLock<HashMap<Identity, Arc<Connection>>>,
    /// Every conversation ever created: ConversationId -> Conversation
    conversations: RwLock<HashMap<ConversationId, SharedConversation>>,
    config: ServerConfig,
}

impl ChatServer {
    /// Create a ChatServer with the default configuration
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a ChatServer, registering the configured conversations
    pub fn with_config(config: ServerConfig) -> Self {
        let conversations = config
            .default_conversations
            .iter()
            .map(|name| {
                let id = ConversationId(name.clone());
                let conversation = Arc::new(Mutex::new(Conversation::new(id.clone())));
                (id, conversation)
            })
            .collect();

        Self {
            connections: RwLock::new(HashMap::new()),
            conversations: RwLock::new(conversations),
            config,
        }
    }

    /// Serve one WebSocket connection until it ends
    ///
    /// Registers the connection under `identity`, dispatches its requests,
    /// and tears it down exactly once however the intake loop ends.
    pub async fn accept<S>(&self, identity: Identity, ws_stream: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (connection, mut inbound) = Connection::spawn(
            identity.clone(),
            ws_stream,
            self.config.outbound_buffer,
            self.config.send_timeout,
        );
        self.register(connection.clone()).await;
        info!("{} connected ({})", identity, connection.id());

        while let Some(next) = inbound.receive().await {
            match next {
                Ok(request) => self.dispatch(&connection, request).await,
                Err(e) => {
                    warn!("Dropping connection {} for {}: {}", connection.id(), identity, e);
                    break;
                }
            }
        }

        self.disconnect(&connection).await;
        if let Err(e) = connection.finish().await {
            debug!("Writer for {} ended with error: {}", identity, e);
        }
        info!("{} disconnected ({})", identity, connection.id());
    }

    /// Put a connection in the connection table
    ///
    /// Last connect wins: a previous connection under the same identity is
    /// replaced but left running, and is returned.
    pub async fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let identity = connection.identity().clone();
        let previous = self.connections.write().await.insert(identity.clone(), connection);
        if let Some(previous) = &previous {
            warn!("{} reconnected, replacing connection {}", identity, previous.id());
        }
        previous
    }

    /// Route one request from a connection
    async fn dispatch(&self, connection: &Connection, request: ClientMessage) {
        let identity = connection.identity().clone();
        match request {
            ClientMessage::Post {
                conversation_id,
                content,
            } => {
                let message = ChatMessage::new(conversation_id, identity, content);
                if let Err(e) = self.post_message(message).await {
                    warn!("Post from {} rejected: {}", connection.identity(), e);
                    if let Err(send_err) = connection.send(ServerMessage::from(&e)) {
                        debug!("Could not report error to {}: {}", connection.identity(), send_err);
                    }
                }
            }
            ClientMessage::Join { conversation_id } => {
                self.join(identity, conversation_id).await;
            }
            ClientMessage::Leave { conversation_id } => {
                self.leave(&identity, &conversation_id).await;
            }
        }
    }

    /// Add an identity to a conversation, creating the conversation if needed
    ///
    /// The joiner gets a `JoinResponse` with the member list, then every
    /// member (the joiner included) gets `MemberJoined`. Joining twice is a
    /// no-op. Returns true if the identity was added.
    pub async fn join(&self, identity: Identity, conversation_id: ConversationId) -> bool {
        let conversation = self.conversation_or_create(&conversation_id).await;
        let mut conversation = conversation.lock().await;

        if !conversation.add_member(identity.clone()) {
            debug!("{} already in conversation {}", identity, conversation_id);
            return false;
        }
        info!("{} joined conversation {}", identity, conversation_id);

        let response = ServerMessage::JoinResponse {
            conversation_id: conversation_id.clone(),
            users: conversation.members().to_vec(),
        };
        self.notify(&identity, response).await;

        let event = ServerMessage::MemberJoined {
            conversation_id,
            username: identity,
        };
        self.fan_out(conversation.members(), &event).await;
        true
    }

    /// Remove an identity from a conversation
    ///
    /// `MemberLeft` goes to the members before the removal, so the leaver
    /// receives it too. Unknown conversations and non-members are no-ops.
    /// Returns true if the identity was removed.
    pub async fn leave(&self, identity: &Identity, conversation_id: &ConversationId) -> bool {
        let Some(conversation) = self.conversation(conversation_id).await else {
            debug!("{} left unknown conversation {}", identity, conversation_id);
            return false;
        };
        let mut conversation = conversation.lock().await;

        if !conversation.contains(identity) {
            return false;
        }

        let event = ServerMessage::MemberLeft {
            conversation_id: conversation_id.clone(),
            username: identity.clone(),
        };
        self.fan_out(conversation.members(), &event).await;
        conversation.remove_member(identity);

        info!("{} left conversation {}", identity, conversation_id);
        true
    }

    /// Append a message to its conversation's history and deliver it to
    /// every member
    ///
    /// Returns the number of members the message was delivered to.
    /// Delivery failures are logged, never returned.
    ///
    /// # Errors
    ///
    /// `UnknownConversation` if the conversation was never created; nothing
    /// is appended or sent in that case.
    pub async fn post_message(&self, message: ChatMessage) -> Result<usize, ChatError> {
        let conversation = self
            .conversation(&message.conversation_id)
            .await
            .ok_or_else(|| ChatError::UnknownConversation(message.conversation_id.clone()))?;
        let mut conversation = conversation.lock().await;

        conversation.push_message(message.clone());
        debug!(
            "{} posted to {} ({} members)",
            message.author,
            message.conversation_id,
            conversation.member_count()
        );

        let event = ServerMessage::Message(message);
        Ok(self.fan_out(conversation.members(), &event).await)
    }

    /// Tear down a connection
    ///
    /// Removes it from the connection table if it is still the registered
    /// connection for its identity, then removes the identity from every
    /// conversation, sending one `MemberLeft` per conversation to the
    /// remaining members. A connection that was already replaced by a
    /// reconnect leaves memberships alone. Returns the number of
    /// conversations left.
    pub async fn disconnect(&self, connection: &Connection) -> usize {
        let identity = connection.identity().clone();
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(&identity) {
                Some(current) if current.id() == connection.id() => {
                    connections.remove(&identity);
                    true
                }
                _ => false,
            }
        };
        connection.close();

        if !removed {
            debug!(
                "Connection {} for {} was replaced, keeping memberships",
                connection.id(),
                identity
            );
            return 0;
        }

        let conversations: Vec<SharedConversation> =
            self.conversations.read().await.values().cloned().collect();

        let mut left = 0;
        for conversation in conversations {
            let mut conversation = conversation.lock().await;
            if !conversation.contains(&identity) {
                continue;
            }
            // A reconnect under the same identity owns the memberships from here on
            if self.is_connected(&identity).await {
                break;
            }

            conversation.remove_member(&identity);
            let event = ServerMessage::MemberLeft {
                conversation_id: conversation.id.clone(),
                username: identity.clone(),
            };
            self.fan_out(conversation.members(), &event).await;
            left += 1;
        }

        debug!("{} removed from {} conversations", identity, left);
        left
    }

    /// Close every connection
    ///
    /// With a notice, every connected client gets it as a `_system` message
    /// and the server waits `drain_timeout` before closing. Each close is
    /// bounded by the send timeout. Errors from individual connections,
    /// timeouts included, are collected and returned.
    pub async fn shutdown(&self, notice: Option<&str>, drain_timeout: Duration) -> Vec<ChatError> {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        info!("Shutting down {} connections", connections.len());

        if let Some(content) = notice {
            let event = ServerMessage::Message(ChatMessage::system(content));
            for connection in &connections {
                if let Err(e) = connection.send(event.clone()) {
                    debug!("Shutdown notice not delivered to {}: {}", connection.identity(), e);
                }
            }
            if !drain_timeout.is_zero() {
                tokio::time::sleep(drain_timeout).await;
            }
        }

        let results = join_all(connections.iter().map(|c| c.finish())).await;
        let errors: Vec<ChatError> = results
            .into_iter()
            .filter_map(Result::err)
            .map(ChatError::from)
            .collect();

        if !errors.is_empty() {
            warn!("{} connections failed to close cleanly", errors.len());
        }
        errors
    }

    /// Summaries of every conversation, sorted by id
    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        let conversations: Vec<SharedConversation> =
            self.conversations.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            summaries.push(conversation.lock().await.summary());
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// A conversation with the last `limit` messages of its history
    pub async fn snapshot(&self, conversation_id: &ConversationId, limit: usize) -> Option<ConversationSnapshot> {
        let conversation = self.conversation(conversation_id).await?;
        let snapshot = conversation.lock().await.snapshot(limit);
        Some(snapshot)
    }

    /// Current members of a conversation, in join order
    pub async fn members(&self, conversation_id: &ConversationId) -> Option<Vec<Identity>> {
        let conversation = self.conversation(conversation_id).await?;
        let members = conversation.lock().await.members().to_vec();
        Some(members)
    }

    /// Check if an identity has a registered connection
    pub async fn is_connected(&self, identity: &Identity) -> bool {
        self.connections.read().await.contains_key(identity)
    }

    /// The registered connection for an identity
    pub async fn connection(&self, identity: &Identity) -> Option<Arc<Connection>> {
        self.connections.read().await.get(identity).cloned()
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            connection_count: self.connections.read().await.len(),
            conversation_count: self.conversations.read().await.len(),
        }
    }

    async fn conversation(&self, conversation_id: &ConversationId) -> Option<SharedConversation> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    async fn conversation_or_create(&self, conversation_id: &ConversationId) -> SharedConversation {
        if let Some(conversation) = self.conversation(conversation_id).await {
            return conversation;
        }
        self.conversations
            .write()
            .await
            .entry(conversation_id.clone())
            .or_insert_with(|| {
                info!("Creating conversation {}", conversation_id);
                Arc::new(Mutex::new(Conversation::new(conversation_id.clone())))
            })
            .clone()
    }

    /// Send an event to one identity
    ///
    /// Returns false if the identity is not connected or the send failed.
    async fn notify(&self, identity: &Identity, event: ServerMessage) -> bool {
        let Some(connection) = self.connection(identity).await else {
            warn!("Unable to notify {}: not connected", identity);
            return false;
        };
        match connection.send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to notify {}: {}", identity, e);
                false
            }
        }
    }

    /// Queue an event for every listed member
    ///
    /// Members without a registered connection are skipped. Queueing never
    /// waits, and one failed or evicted recipient never affects the others.
    /// Returns the number of successful sends.
    async fn fan_out(&self, members: &[Identity], event: &ServerMessage) -> usize {
        let recipients: Vec<Arc<Connection>> = {
            let connections = self.connections.read().await;
            members
                .iter()
                .filter_map(|member| {
                    let connection = connections.get(member).cloned();
                    if connection.is_none() {
                        warn!("Skipping {}: not connected", member);
                    }
                    connection
                })
                .collect()
        };

        let mut delivered = 0;
        for connection in &recipients {
            match connection.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to deliver to {}: {}", connection.identity(), e),
            }
        }
        delivered
    }
}

impl Default for ChatServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    /// Number of registered connections
    pub connection_count: usize,
    /// Number of conversations, empty ones included
    pub conversation_count: usize,
}
