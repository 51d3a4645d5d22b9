/// Database row types: these map directly to SQLite rows.
/// Distinct from ledgerdesk-types API models to keep the DB layer independent.
/// Identifiers and timestamps stay as stored TEXT here.

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub password: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub id: String,
    pub full_name: String,
    pub avatar_url: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub title: Option<String>,
    pub is_group: bool,
}

/// Participant joined with its profile; the profile is absent only if the
/// profile row was never created.
#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub joined_at: String,
    pub last_read_message_id: Option<String>,
    pub profile: Option<ProfileRow>,
}

/// Message joined with its sender profile. `has_attachments` is computed from
/// the attachment table, never stored.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
    pub has_attachments: bool,
    pub sender: Option<ProfileRow>,
}

#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub id: String,
    pub message_id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub created_at: String,
}

/// Attachment metadata to insert together with a message.
pub struct NewAttachmentRow<'a> {
    pub id: &'a str,
    pub file_path: &'a str,
    pub file_name: &'a str,
    pub file_size: i64,
    pub file_type: &'a str,
}
