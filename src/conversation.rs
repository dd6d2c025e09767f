//! Conversation struct definition
//!
//! Represents a named conversation with its members and message history.

use serde::Serialize;

use crate::message::ChatMessage;
use crate::types::{ConversationId, Identity};

/// Named conversation
///
/// Members are kept in join order so listings are deterministic. History is
/// append-only. Only the `ChatServer` mutates a conversation, always while
/// holding the conversation's lock.
#[derive(Debug)]
pub struct Conversation {
    /// Conversation key
    pub id: ConversationId,
    /// Display title
    pub title: String,
    /// Current members, in join order
    members: Vec<Identity>,
    /// Every message ever posted, oldest first
    history: Vec<ChatMessage>,
}

impl Conversation {
    /// Create an empty conversation titled by its id
    pub fn new(id: ConversationId) -> Self {
        Self {
            title: id.to_string(),
            id,
            members: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Check if an identity is a member
    pub fn contains(&self, identity: &Identity) -> bool {
        self.members.contains(identity)
    }

    /// Add a member
    ///
    /// Returns false if the identity was already a member.
    pub fn add_member(&mut self, identity: Identity) -> bool {
        if self.contains(&identity) {
            false
        } else {
            self.members.push(identity);
            true
        }
    }

    /// Remove a member
    ///
    /// Returns false if the identity was not a member.
    pub fn remove_member(&mut self, identity: &Identity) -> bool {
        match self.members.iter().position(|m| m == identity) {
            Some(index) => {
                self.members.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn members(&self) -> &[Identity] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Append a message to the history
    pub fn push_message(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// The last `limit` messages, oldest first
    pub fn tail(&self, limit: usize) -> &[ChatMessage] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }

    /// Listing entry for this conversation
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            member_count: self.member_count(),
        }
    }

    /// Copy of the conversation with at most `limit` trailing messages
    pub fn snapshot(&self, limit: usize) -> ConversationSnapshot {
        ConversationSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            users: self.members.clone(),
            messages: self.tail(limit).to_vec(),
        }
    }
}

/// Conversation listing entry with its live member count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub member_count: usize,
}

/// Point-in-time copy of a conversation and the tail of its history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSnapshot {
    pub id: ConversationId,
    pub title: String,
    pub users: Vec<Identity>,
    pub messages: Vec<ChatMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> ChatMessage {
        ChatMessage::new("general".into(), "alice".into(), content)
    }

    #[test]
    fn test_conversation_creation() {
        let conversation = Conversation::new("general".into());

        assert_eq!(conversation.id.as_str(), "general");
        assert_eq!(conversation.title, "general");
        assert_eq!(conversation.member_count(), 0);
        assert!(conversation.history().is_empty());
    }

    #[test]
    fn test_add_member_is_idempotent() {
        let mut conversation = Conversation::new("general".into());

        assert!(conversation.add_member("alice".into()));
        assert!(!conversation.add_member("alice".into()));
        assert_eq!(conversation.members(), &[Identity::from("alice")]);
    }

    #[test]
    fn test_members_keep_join_order() {
        let mut conversation = Conversation::new("general".into());
        conversation.add_member("carol".into());
        conversation.add_member("alice".into());
        conversation.add_member("bob".into());

        let names: Vec<&str> = conversation.members().iter().map(Identity::as_str).collect();
        assert_eq!(names, vec!["carol", "alice", "bob"]);
    }

    #[test]
    fn test_remove_member() {
        let mut conversation = Conversation::new("general".into());
        conversation.add_member("alice".into());
        conversation.add_member("bob".into());

        assert!(conversation.remove_member(&"alice".into()));
        assert!(!conversation.remove_member(&"alice".into()));
        assert!(!conversation.contains(&"alice".into()));
        assert!(conversation.contains(&"bob".into()));
    }

    #[test]
    fn test_join_leave_sequence_never_duplicates() {
        let mut conversation = Conversation::new("general".into());
        let alice = Identity::from("alice");

        conversation.add_member(alice.clone());
        conversation.add_member(alice.clone());
        conversation.remove_member(&alice);
        conversation.remove_member(&alice);
        conversation.add_member(alice.clone());

        assert_eq!(conversation.member_count(), 1);
    }

    #[test]
    fn test_tail_returns_latest_messages() {
        let mut conversation = Conversation::new("general".into());
        for content in ["one", "two", "three"] {
            conversation.push_message(message(content));
        }

        let tail: Vec<&str> = conversation.tail(2).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(tail, vec!["two", "three"]);
        assert_eq!(conversation.tail(10).len(), 3);
        assert!(conversation.tail(0).is_empty());
    }

    #[test]
    fn test_snapshot() {
        let mut conversation = Conversation::new("general".into());
        conversation.add_member("alice".into());
        conversation.push_message(message("one"));
        conversation.push_message(message("two"));

        let snapshot = conversation.snapshot(1);
        assert_eq!(snapshot.title, "general");
        assert_eq!(snapshot.users, vec![Identity::from("alice")]);
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].content, "two");
    }
}
