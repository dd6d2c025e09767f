//! Basic type definitions for the chat relay
//!
//! Provides newtype wrappers for type safety:
//! - `Identity`: the username bound to a connection
//! - `ConversationId`: key of a conversation
//! - `ConnectionId`: UUID-based identifier of one connection instance

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of a connected participant
///
/// Assigned by the transport adapter at connect time. The relay treats it as
/// an opaque string; two connections may carry the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    /// Identity used for messages emitted by the relay itself
    pub fn system() -> Self {
        Self(SYSTEM.to_string())
    }

    /// Check if a name is reserved for the relay and cannot be claimed
    pub fn is_reserved(name: &str) -> bool {
        name == SYSTEM
    }

    /// Random identity for clients that connect without a username
    pub fn anonymous() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation key (case-sensitive, used verbatim)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Pseudo-conversation carrying relay-wide notices
    pub fn system() -> Self {
        Self(SYSTEM.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one connection instance (newtype pattern)
///
/// Distinguishes a reconnect from the connection it replaced even when both
/// carry the same `Identity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const SYSTEM: &str = "_system";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_anonymous_identities_differ() {
        assert_ne!(Identity::anonymous(), Identity::anonymous());
    }

    #[test]
    fn test_identity_serializes_as_plain_string() {
        let json = serde_json::to_string(&Identity::from("alice")).unwrap();
        assert_eq!(json, "\"alice\"");
    }
}
