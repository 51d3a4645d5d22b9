use crate::Database;
use crate::models::{
    AttachmentRow, ConversationRow, MessageRow, NewAttachmentRow, ParticipantRow, ProfileRow,
    UserRow,
};
use crate::time;
use anyhow::Result;
use rusqlite::{Connection, Row, ToSql};

/// Message columns joined with the sender profile. `has_attachments` is derived.
const MESSAGE_SELECT: &str = "
    SELECT m.id, m.conversation_id, m.sender_id, m.content, m.created_at,
           EXISTS(SELECT 1 FROM message_attachments a WHERE a.message_id = m.id),
           p.id, p.full_name, p.avatar_url, p.email
    FROM messages m
    LEFT JOIN profiles p ON p.id = m.sender_id";

impl Database {
    // -- Users & profiles --

    /// Creates the credential row and the matching profile in one transaction.
    pub fn create_user(
        &self,
        id: &str,
        email: &str,
        password_hash: &str,
        full_name: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let now = time::now();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO users (id, email, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, email, password_hash, &now),
            )?;
            tx.execute(
                "INSERT INTO profiles (id, full_name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, full_name, email, &now),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, email, password, created_at FROM users WHERE email = ?1",
                [email],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        password: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| query_profile(conn, id))
    }

    /// Inserts a profile unless one already exists. Returns true if inserted.
    pub fn insert_profile_if_missing(&self, id: &str, email: &str, full_name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO profiles (id, full_name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, full_name, email, time::now()),
            )?;
            Ok(inserted > 0)
        })
    }

    /// Returns the ids from `ids` that have no profile row.
    pub fn missing_profiles(&self, ids: &[String]) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT 1 FROM profiles WHERE id = ?1")?;
            let mut missing = Vec::new();
            for id in ids {
                if !stmt.exists([id])? {
                    missing.push(id.clone());
                }
            }
            Ok(missing)
        })
    }

    // -- Conversations --

    /// Inserts the conversation and all participant rows atomically.
    pub fn create_conversation(
        &self,
        id: &str,
        title: Option<&str>,
        is_group: bool,
        participant_ids: &[String],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let now = time::now();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, created_at, updated_at, title, is_group) VALUES (?1, ?2, ?2, ?3, ?4)",
                rusqlite::params![id, now, title, is_group],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO conversation_participants (conversation_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                )?;
                for user_id in participant_ids {
                    stmt.execute((id, user_id, &now))?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, created_at, updated_at, title, is_group FROM conversations WHERE id = ?1",
                [id],
                map_conversation,
            )
            .optional()
        })
    }

    /// Conversations the user participates in, most recently active first.
    pub fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.created_at, c.updated_at, c.title, c.is_group
                 FROM conversations c
                 JOIN conversation_participants cp ON cp.conversation_id = c.id
                 WHERE cp.user_id = ?1
                 ORDER BY c.updated_at DESC, c.id ASC",
            )?;
            let rows = stmt
                .query_map([user_id], map_conversation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Batch-fetch participants (with profiles) for a set of conversations.
    pub fn get_participants(&self, conversation_ids: &[String]) -> Result<Vec<ParticipantRow>> {
        if conversation_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT cp.conversation_id, cp.user_id, cp.joined_at, cp.last_read_message_id,
                        p.id, p.full_name, p.avatar_url, p.email
                 FROM conversation_participants cp
                 LEFT JOIN profiles p ON p.id = cp.user_id
                 WHERE cp.conversation_id IN ({})
                 ORDER BY cp.joined_at ASC, cp.user_id ASC",
                placeholders(conversation_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(as_params(conversation_ids).as_slice(), map_participant)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ParticipantRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT cp.conversation_id, cp.user_id, cp.joined_at, cp.last_read_message_id,
                        p.id, p.full_name, p.avatar_url, p.email
                 FROM conversation_participants cp
                 LEFT JOIN profiles p ON p.id = cp.user_id
                 WHERE cp.conversation_id = ?1 AND cp.user_id = ?2",
                [conversation_id, user_id],
                map_participant,
            )
            .optional()
        })
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn
                .prepare(
                    "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
                )?
                .exists([conversation_id, user_id])?;
            Ok(exists)
        })
    }

    // -- Messages --

    /// Inserts a message and its attachment rows, and bumps the conversation's
    /// `updated_at`. Returns the stored `created_at`.
    ///
    /// `created_at` is strictly greater than every earlier message in the same
    /// conversation.
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        attachments: &[NewAttachmentRow<'_>],
    ) -> Result<String> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let newest: Option<String> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )?;
            let created_at = time::next_after(newest.as_deref())?;

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, conversation_id, sender_id, content, &created_at),
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO message_attachments (id, message_id, file_path, file_name, file_size, file_type, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for a in attachments {
                    stmt.execute(rusqlite::params![
                        a.id,
                        id,
                        a.file_path,
                        a.file_name,
                        a.file_size,
                        a.file_type,
                        created_at
                    ])?;
                }
            }

            tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1 AND updated_at < ?2",
                (conversation_id, &created_at),
            )?;

            tx.commit()?;
            Ok(created_at)
        })
    }

    /// Newest-first page of messages. `before` restricts the page to messages
    /// strictly older than the given encoded timestamp.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1 AND (?3 IS NULL OR m.created_at < ?3)
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit, before], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!("{MESSAGE_SELECT} WHERE m.id = ?1");
            conn.query_row(&sql, [id], map_message).optional()
        })
    }

    /// The newest message of each given conversation. Conversations without
    /// messages are absent from the result.
    pub fn get_last_messages(&self, conversation_ids: &[String]) -> Result<Vec<MessageRow>> {
        if conversation_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id IN ({})
                   AND m.created_at = (
                       SELECT MAX(m2.created_at) FROM messages m2
                       WHERE m2.conversation_id = m.conversation_id
                   )",
                placeholders(conversation_ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(as_params(conversation_ids).as_slice(), map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Batch-fetch attachments for a set of message IDs.
    pub fn get_attachments_for_messages(&self, message_ids: &[String]) -> Result<Vec<AttachmentRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, message_id, file_path, file_name, file_size, file_type, created_at
                 FROM message_attachments
                 WHERE message_id IN ({})
                 ORDER BY created_at ASC, id ASC",
                placeholders(message_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(as_params(message_ids).as_slice(), |row| {
                    Ok(AttachmentRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        file_path: row.get(2)?,
                        file_name: row.get(3)?,
                        file_size: row.get(4)?,
                        file_type: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Read tracking --

    /// Points the participant's last-read marker at `message_id`.
    /// Returns false if no participant row matched.
    pub fn set_last_read(&self, conversation_id: &str, user_id: &str, message_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE conversation_participants SET last_read_message_id = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id, message_id),
            )?;
            Ok(updated > 0)
        })
    }

    /// Messages from other senders newer than the user's last-read message.
    pub fn count_unread(&self, conversation_id: &str, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages m
                 JOIN conversation_participants cp
                   ON cp.conversation_id = m.conversation_id AND cp.user_id = ?2
                 LEFT JOIN messages r ON r.id = cp.last_read_message_id
                 WHERE m.conversation_id = ?1
                   AND m.sender_id != ?2
                   AND m.created_at > COALESCE(r.created_at, '')",
                [conversation_id, user_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// Unread messages across every conversation the user participates in.
    pub fn count_unread_for_user(&self, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages m
                 JOIN conversation_participants cp
                   ON cp.conversation_id = m.conversation_id AND cp.user_id = ?1
                 LEFT JOIN messages r ON r.id = cp.last_read_message_id
                 WHERE m.sender_id != ?1
                   AND m.created_at > COALESCE(r.created_at, '')",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    // -- Stats --

    pub fn count_messages_for_user(&self, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages m
                 JOIN conversation_participants cp ON cp.conversation_id = m.conversation_id
                 WHERE cp.user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// `created_at` of every message at or after `since` in the user's conversations.
    pub fn message_timestamps_since(&self, user_id: &str, since: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.created_at FROM messages m
                 JOIN conversation_participants cp ON cp.conversation_id = m.conversation_id
                 WHERE cp.user_id = ?1 AND m.created_at >= ?2",
            )?;
            let rows = stmt
                .query_map([user_id, since], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_profile(conn: &Connection, id: &str) -> Result<Option<ProfileRow>> {
    conn.query_row(
        "SELECT id, full_name, avatar_url, email FROM profiles WHERE id = ?1",
        [id],
        |row| {
            Ok(ProfileRow {
                id: row.get(0)?,
                full_name: row.get(1)?,
                avatar_url: row.get(2)?,
                email: row.get(3)?,
            })
        },
    )
    .optional()
}

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
        title: row.get(3)?,
        is_group: row.get(4)?,
    })
}

fn map_participant(row: &Row<'_>) -> rusqlite::Result<ParticipantRow> {
    Ok(ParticipantRow {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        joined_at: row.get(2)?,
        last_read_message_id: row.get(3)?,
        profile: map_joined_profile(row, 4)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        has_attachments: row.get(5)?,
        sender: map_joined_profile(row, 6)?,
    })
}

/// Reads a LEFT JOINed profile starting at column `start`.
fn map_joined_profile(row: &Row<'_>, start: usize) -> rusqlite::Result<Option<ProfileRow>> {
    let Some(id) = row.get::<_, Option<String>>(start)? else {
        return Ok(None);
    };
    Ok(Some(ProfileRow {
        id,
        full_name: row.get(start + 1)?,
        avatar_url: row.get(start + 2)?,
        email: row.get(start + 3)?,
    }))
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

fn as_params(ids: &[String]) -> Vec<&dyn ToSql> {
    ids.iter().map(|id| id as &dyn ToSql).collect()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
