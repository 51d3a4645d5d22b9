use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display fields for a user. Denormalized into messages and participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub full_name: String,
    pub avatar_url: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Only meaningful for group conversations.
    pub title: Option<String>,
    pub is_group: bool,
    pub participants: Vec<ConversationParticipant>,
    pub last_message: Option<Message>,
}

impl Conversation {
    /// The first participant that is not `user_id`. For 1:1 conversations this
    /// is the counterpart shown in the conversation list.
    pub fn other_participant(&self, user_id: Uuid) -> Option<&ConversationParticipant> {
        self.participants.iter().find(|p| p.user_id != user_id)
    }

    pub fn participant(&self, user_id: Uuid) -> Option<&ConversationParticipant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }
}

/// Membership of a user in a conversation, keyed by (conversation_id, user_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationParticipant {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub last_read_message_id: Option<Uuid>,
    pub user: Option<UserProfile>,
}

/// A message as returned to clients: sender profile and attachments included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub has_attachments: bool,
    pub sender: Option<UserProfile>,
    #[serde(default)]
    pub attachments: Vec<MessageAttachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAttachment {
    pub id: Uuid,
    pub message_id: Uuid,
    /// Location of the blob in object storage. Bytes are never served from here.
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub created_at: DateTime<Utc>,
}

/// Attachment metadata supplied by a sender alongside a new message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewAttachment {
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
}

/// Messaging KPIs for the dashboard widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub unread_messages: usize,
    pub conversations_today: usize,
    /// Index 0 is today (UTC), index 6 is six days ago.
    pub messages_by_day: [usize; 7],
}
