use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Routing key for the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id")]
pub enum Topic {
    /// Changes inside one conversation (new messages, read pointers).
    Conversation(Uuid),
    /// Changes to the set of conversations (creation). Subscribers filter by
    /// participant membership.
    Directory,
}

/// A server-side row change, published after the write commits.
///
/// Payloads carry identifiers only; subscribers re-read whatever they need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Change {
    MessageInserted {
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
    },
    ReadPositionUpdated {
        conversation_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
    },
    ConversationCreated {
        conversation_id: Uuid,
        participant_ids: Vec<Uuid>,
    },
}

impl Change {
    pub fn topic(&self) -> Topic {
        match self {
            Self::MessageInserted { conversation_id, .. } => Topic::Conversation(*conversation_id),
            Self::ReadPositionUpdated { conversation_id, .. } => {
                Topic::Conversation(*conversation_id)
            }
            Self::ConversationCreated { .. } => Topic::Directory,
        }
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A new message was posted in a subscribed conversation, fully hydrated
    MessageCreate { message: Message },

    /// A participant moved their read pointer
    ReadPositionUpdate {
        conversation_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
    },

    /// The user was added to a new conversation
    ConversationCreate { conversation_id: Uuid },

    /// Acknowledges the current subscription set after a Subscribe/Unsubscribe
    Subscribed { conversation_ids: Vec<Uuid> },

    /// A command was rejected
    Error { reason: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Start receiving conversation-scoped events for these conversations.
    /// Conversations the user is not a participant of are ignored.
    Subscribe { conversation_ids: Vec<Uuid> },

    /// Stop receiving events for these conversations.
    Unsubscribe { conversation_ids: Vec<Uuid> },
}
