//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's tagged enum
//! for type-safe serialization/deserialization. The `event` field is the
//! discriminator in both directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::types::{ConversationId, Identity};

/// Client → Server message
///
/// Posts carry no author: the relay binds it to the connection's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientMessage {
    /// Post a chat message to a conversation
    #[serde(rename = "conversation.message")]
    Post {
        conversation_id: ConversationId,
        content: String,
    },
    /// Join a conversation, creating it if needed
    #[serde(rename = "request.conversation.join")]
    Join { conversation_id: ConversationId },
    /// Leave a conversation
    #[serde(rename = "request.conversation.leave")]
    Leave { conversation_id: ConversationId },
}

/// A chat message as delivered to members and kept in history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub conversation_id: ConversationId,
    #[serde(rename = "username")]
    pub author: Identity,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a message stamped with the current time
    pub fn new(conversation_id: ConversationId, author: Identity, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            author,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Relay-wide notice, addressed from and to `_system`
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ConversationId::system(), Identity::system(), content)
    }
}

/// Server → Client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    /// Chat message posted to a conversation
    #[serde(rename = "conversation.message")]
    Message(ChatMessage),
    /// Join accepted; sent to the joiner only
    #[serde(rename = "response.conversation.join")]
    JoinResponse {
        conversation_id: ConversationId,
        users: Vec<Identity>,
    },
    /// A member joined the conversation
    #[serde(rename = "event.conversation.join")]
    MemberJoined {
        conversation_id: ConversationId,
        username: Identity,
    },
    /// A member left the conversation or disconnected
    #[serde(rename = "event.conversation.leave")]
    MemberLeft {
        conversation_id: ConversationId,
        username: Identity,
    },
    /// Request failed; sent to the requester only
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    /// Conversation this event belongs to, if any
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            ServerMessage::Message(msg) => Some(&msg.conversation_id),
            ServerMessage::JoinResponse { conversation_id, .. }
            | ServerMessage::MemberJoined { conversation_id, .. }
            | ServerMessage::MemberLeft { conversation_id, .. } => Some(conversation_id),
            ServerMessage::Error { .. } => None,
        }
    }
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Post to a conversation that does not exist
    UnknownConversation,
    /// Invalid message format
    InvalidMessage,
    /// Anything the client cannot act on
    Internal,
}

/// Decode one inbound frame
///
/// Any frame that is not a JSON object with a known `event` and its
/// required fields is a protocol violation carrying the raw payload.
pub fn decode_request(payload: &str) -> Result<ClientMessage, ChatError> {
    serde_json::from_str(payload).map_err(|e| ChatError::Protocol {
        payload: payload.to_string(),
        reason: e.to_string(),
    })
}

/// Convert ChatError to ServerMessage for client notification
impl From<&ChatError> for ServerMessage {
    fn from(err: &ChatError) -> Self {
        let (code, message) = match err {
            ChatError::UnknownConversation(conversation_id) => (
                ErrorCode::UnknownConversation,
                format!("Conversation '{}' not found", conversation_id),
            ),
            ChatError::Protocol { reason, .. } => {
                (ErrorCode::InvalidMessage, format!("Invalid message format: {}", reason))
            }
            // Fatal errors are not typically converted (connection closes)
            _ => (ErrorCode::Internal, "Internal error".to_string()),
        };
        ServerMessage::Error { code, message }
    }
}
