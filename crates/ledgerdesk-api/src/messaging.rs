//! Messaging operations over the database and the change feed.
//!
//! Every method runs its storage work on the blocking pool. Writes publish a
//! [`Change`] only after they commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ledgerdesk_db::Database;
use ledgerdesk_db::models::{
    AttachmentRow, ConversationRow, MessageRow, NewAttachmentRow, ParticipantRow, ProfileRow,
};
use ledgerdesk_db::time;
use ledgerdesk_realtime::{ChangeFeed, Subscription};
use ledgerdesk_types::events::{Change, Topic};
use ledgerdesk_types::models::{
    CommunicationStats, Conversation, ConversationParticipant, Message, MessageAttachment,
    NewAttachment, UserProfile,
};

use crate::error::MessagingError;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;
const MAX_CONTENT_LEN: usize = 8000;
const MAX_TITLE_LEN: usize = 120;

type Result<T> = std::result::Result<T, MessagingError>;

#[derive(Clone)]
pub struct Messaging {
    db: Arc<Database>,
    feed: ChangeFeed,
}

impl Messaging {
    pub fn new(db: Arc<Database>, feed: ChangeFeed) -> Self {
        Self { db, feed }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Run `f` against the database off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                MessagingError::Backend(anyhow!("blocking task failed: {}", e))
            })?
    }

    // -- Conversation directory --

    /// Every conversation `user_id` participates in, with participants and the
    /// latest message, most recently active first.
    pub async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.blocking(move |db| load_conversations(db, &user_id.to_string()))
            .await
    }

    /// Case-insensitive filter over [`Self::list_conversations`]. One-to-one
    /// conversations match on the other participant's name, groups on title.
    pub async fn search_conversations(&self, user_id: Uuid, query: &str) -> Result<Vec<Conversation>> {
        let conversations = self.list_conversations(user_id).await?;
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(conversations);
        }

        Ok(conversations
            .into_iter()
            .filter(|c| conversation_matches(c, user_id, &needle))
            .collect())
    }

    pub async fn create_conversation(
        &self,
        creator_id: Uuid,
        participant_ids: &[Uuid],
        is_group: bool,
        title: Option<String>,
    ) -> Result<Conversation> {
        let mut seen = HashSet::new();
        let members: Vec<Uuid> = std::iter::once(creator_id)
            .chain(participant_ids.iter().copied())
            .filter(|id| seen.insert(*id))
            .collect();

        if is_group && members.len() < 2 {
            return Err(MessagingError::Invalid(
                "a group needs at least one other participant".into(),
            ));
        }
        if !is_group && members.len() != 2 {
            return Err(MessagingError::Invalid(
                "a direct conversation has exactly two participants".into(),
            ));
        }

        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if title.as_ref().is_some_and(|t| t.chars().count() > MAX_TITLE_LEN) {
            return Err(MessagingError::Invalid("title too long".into()));
        }

        let conversation_id = Uuid::new_v4();
        let member_ids: Vec<String> = members.iter().map(Uuid::to_string).collect();

        let conversation = self
            .blocking(move |db| {
                let missing = db.missing_profiles(&member_ids)?;
                if !missing.is_empty() {
                    return Err(MessagingError::Invalid(format!(
                        "unknown participants: {}",
                        missing.join(", ")
                    )));
                }

                let cid = conversation_id.to_string();
                db.create_conversation(&cid, title.as_deref(), is_group, &member_ids)?;
                let row = db
                    .get_conversation(&cid)?
                    .ok_or(MessagingError::NotFound("conversation"))?;
                let participants = db.get_participants(std::slice::from_ref(&cid))?;
                build_conversation(row, participants, None)
            })
            .await?;

        info!(
            "Conversation {} created by {} with {} participants",
            conversation_id,
            creator_id,
            members.len()
        );

        self.feed.publish(Change::ConversationCreated {
            conversation_id,
            participant_ids: members,
        });

        Ok(conversation)
    }

    /// The newest message of each conversation that has one.
    pub async fn last_messages(&self, conversation_ids: &[Uuid]) -> Result<Vec<Message>> {
        let ids: Vec<String> = conversation_ids.iter().map(Uuid::to_string).collect();
        self.blocking(move |db| {
            let rows = db.get_last_messages(&ids)?;
            Ok(hydrate_messages(db, rows)?)
        })
        .await
    }

    // -- Messages --

    /// Most recent messages of a conversation, newest first. `limit` defaults
    /// to 50 and is clamped to 1..=200. `before` selects the page strictly
    /// older than that instant.
    pub async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        limit: Option<u32>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let before = before.map(time::encode);

        self.blocking(move |db| {
            let rows = db.get_messages(&conversation_id.to_string(), limit, before.as_deref())?;
            Ok(hydrate_messages(db, rows)?)
        })
        .await
    }

    pub async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        self.blocking(move |db| load_message(db, &message_id.to_string()))
            .await
    }

    /// Append a message. `has_attachments` on the result reflects whether any
    /// attachment rows were stored with it.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        attachments: Vec<NewAttachment>,
    ) -> Result<Message> {
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(MessagingError::Invalid("message is empty".into()));
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            return Err(MessagingError::Invalid("message too long".into()));
        }
        for a in &attachments {
            if a.file_path.trim().is_empty() || a.file_name.trim().is_empty() {
                return Err(MessagingError::Invalid("attachment path and name are required".into()));
            }
            if a.file_size < 0 {
                return Err(MessagingError::Invalid("attachment size is negative".into()));
            }
        }

        let message_id = Uuid::new_v4();
        let content = content.to_string();

        let message = self
            .blocking(move |db| {
                let cid = conversation_id.to_string();
                let sid = sender_id.to_string();
                authorize(db, &cid, &sid)?;

                let attachment_ids: Vec<String> =
                    attachments.iter().map(|_| Uuid::new_v4().to_string()).collect();
                let rows: Vec<NewAttachmentRow<'_>> = attachments
                    .iter()
                    .zip(&attachment_ids)
                    .map(|(a, id)| NewAttachmentRow {
                        id,
                        file_path: &a.file_path,
                        file_name: &a.file_name,
                        file_size: a.file_size,
                        file_type: &a.file_type,
                    })
                    .collect();

                let mid = message_id.to_string();
                db.insert_message(&mid, &cid, &sid, &content, &rows)?;
                load_message(db, &mid)?.ok_or(MessagingError::NotFound("message"))
            })
            .await?;

        debug!(
            "Message {} stored in {} by {} ({} attachments)",
            message.id,
            conversation_id,
            sender_id,
            message.attachments.len()
        );

        self.feed.publish(Change::MessageInserted {
            conversation_id,
            message_id,
            sender_id,
        });

        Ok(message)
    }

    // -- Realtime bridge --

    /// Call `callback` with every message inserted into `conversation_id`
    /// after this call, re-read from storage with sender and attachments.
    ///
    /// Notifications whose message can no longer be read are skipped.
    pub fn subscribe_to_messages<F>(&self, conversation_id: Uuid, callback: F) -> Subscription
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let messaging = self.clone();

        self.feed.register(
            Topic::Conversation(conversation_id),
            |change| matches!(change, Change::MessageInserted { .. }),
            move |change| {
                let messaging = messaging.clone();
                let callback = callback.clone();
                async move {
                    let Change::MessageInserted { message_id, .. } = change else {
                        return;
                    };
                    match messaging.get_message(message_id).await {
                        Ok(Some(message)) => callback(message),
                        Ok(None) => warn!("Inserted message {} vanished before delivery", message_id),
                        Err(e) => error!("Failed to load inserted message {}: {}", message_id, e),
                    }
                }
            },
        )
    }

    /// Call `callback` with the id of each conversation created with `user_id`
    /// as a participant.
    pub fn subscribe_to_directory<F>(&self, user_id: Uuid, callback: F) -> Subscription
    where
        F: Fn(Uuid) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        self.feed.register(
            Topic::Directory,
            move |change| {
                matches!(change, Change::ConversationCreated { participant_ids, .. }
                    if participant_ids.contains(&user_id))
            },
            move |change| {
                let callback = callback.clone();
                async move {
                    if let Change::ConversationCreated { conversation_id, .. } = change {
                        callback(conversation_id);
                    }
                }
            },
        )
    }

    // -- Read tracking --

    /// Point `user_id`'s last-read marker in `conversation_id` at `message_id`.
    ///
    /// The marker is set exactly as given, even if it moves backwards.
    pub async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid, message_id: Uuid) -> Result<()> {
        self.blocking(move |db| {
            let mid = message_id.to_string();
            let cid = conversation_id.to_string();
            let message = db.get_message(&mid)?.ok_or(MessagingError::NotFound("message"))?;
            if message.conversation_id != cid {
                return Err(MessagingError::NotFound("message"));
            }
            if !db.set_last_read(&cid, &user_id.to_string(), &mid)? {
                return Err(MessagingError::NotFound("participant"));
            }
            Ok(())
        })
        .await?;

        debug!("{} read {} up to {}", user_id, conversation_id, message_id);

        self.feed.publish(Change::ReadPositionUpdated {
            conversation_id,
            user_id,
            message_id,
        });

        Ok(())
    }

    pub async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> Result<usize> {
        self.blocking(move |db| Ok(db.count_unread(&conversation_id.to_string(), &user_id.to_string())?))
            .await
    }

    // -- Access checks --

    /// Not-found if the conversation does not exist, forbidden if `user_id`
    /// is not one of its participants.
    pub async fn authorize(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        self.blocking(move |db| authorize(db, &conversation_id.to_string(), &user_id.to_string()))
            .await
    }

    // -- Profiles --

    pub async fn get_user_profile(&self, user_id: Uuid) -> Result<UserProfile> {
        self.blocking(move |db| {
            let row = db
                .get_profile(&user_id.to_string())?
                .ok_or(MessagingError::NotFound("profile"))?;
            Ok(profile_from_row(row)?)
        })
        .await
    }

    /// Fetch the profile, creating a minimal one if none exists yet.
    pub async fn ensure_profile(&self, user_id: Uuid, email: &str, full_name: &str) -> Result<UserProfile> {
        let email = email.to_string();
        let full_name = full_name.to_string();
        self.blocking(move |db| {
            let id = user_id.to_string();
            if db.insert_profile_if_missing(&id, &email, &full_name)? {
                info!("Created missing profile for {}", user_id);
            }
            let row = db.get_profile(&id)?.ok_or(MessagingError::NotFound("profile"))?;
            Ok(profile_from_row(row)?)
        })
        .await
    }

    // -- Stats --

    pub async fn communication_stats(&self, user_id: Uuid) -> Result<CommunicationStats> {
        self.communication_stats_at(user_id, Utc::now()).await
    }

    /// Stats as seen at `now`; days are UTC calendar days.
    pub async fn communication_stats_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CommunicationStats> {
        self.blocking(move |db| {
            let uid = user_id.to_string();
            let today = now.date_naive();
            let window_start = (today - Duration::days(6))
                .and_hms_opt(0, 0, 0)
                .context("invalid window start")?
                .and_utc();

            let conversations = db.list_conversations_for_user(&uid)?;
            let mut conversations_today = 0;
            for c in &conversations {
                if time::decode(&c.updated_at)?.date_naive() == today {
                    conversations_today += 1;
                }
            }

            let mut messages_by_day = [0usize; 7];
            for raw in db.message_timestamps_since(&uid, &time::encode(window_start))? {
                let age = (today - time::decode(&raw)?.date_naive()).num_days();
                if (0..7).contains(&age) {
                    messages_by_day[age as usize] += 1;
                }
            }

            Ok(CommunicationStats {
                total_conversations: conversations.len(),
                total_messages: db.count_messages_for_user(&uid)?,
                unread_messages: db.count_unread_for_user(&uid)?,
                conversations_today,
                messages_by_day,
            })
        })
        .await
    }
}

// -- Blocking helpers --

fn authorize(db: &Database, conversation_id: &str, user_id: &str) -> Result<()> {
    if db.get_conversation(conversation_id)?.is_none() {
        return Err(MessagingError::NotFound("conversation"));
    }
    if !db.is_participant(conversation_id, user_id)? {
        return Err(MessagingError::Forbidden(
            "not a participant of this conversation".into(),
        ));
    }
    Ok(())
}

fn load_conversations(db: &Database, user_id: &str) -> Result<Vec<Conversation>> {
    let rows = db.list_conversations_for_user(user_id)?;
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

    let mut participants: HashMap<String, Vec<ParticipantRow>> = HashMap::new();
    for p in db.get_participants(&ids)? {
        participants.entry(p.conversation_id.clone()).or_default().push(p);
    }

    let mut last: HashMap<Uuid, Message> = hydrate_messages(db, db.get_last_messages(&ids)?)?
        .into_iter()
        .map(|m| (m.conversation_id, m))
        .collect();

    rows.into_iter()
        .map(|row| {
            let members = participants.remove(&row.id).unwrap_or_default();
            let id = parse_id(&row.id)?;
            build_conversation(row, members, last.remove(&id))
        })
        .collect()
}

fn load_message(db: &Database, message_id: &str) -> Result<Option<Message>> {
    let Some(row) = db.get_message(message_id)? else {
        return Ok(None);
    };
    Ok(hydrate_messages(db, vec![row])?.pop())
}

/// Attach attachment rows to message rows, preserving order.
fn hydrate_messages(db: &Database, rows: Vec<MessageRow>) -> anyhow::Result<Vec<Message>> {
    let ids: Vec<String> = rows.iter().filter(|r| r.has_attachments).map(|r| r.id.clone()).collect();

    let mut attachments: HashMap<String, Vec<MessageAttachment>> = HashMap::new();
    for row in db.get_attachments_for_messages(&ids)? {
        attachments
            .entry(row.message_id.clone())
            .or_default()
            .push(attachment_from_row(row)?);
    }

    rows.into_iter()
        .map(|row| {
            let files = attachments.remove(&row.id).unwrap_or_default();
            message_from_row(row, files)
        })
        .collect()
}

fn conversation_matches(conversation: &Conversation, user_id: Uuid, needle: &str) -> bool {
    if !conversation.is_group {
        if let Some(profile) = conversation
            .other_participant(user_id)
            .and_then(|p| p.user.as_ref())
        {
            return profile.full_name.to_lowercase().contains(needle);
        }
    }
    conversation
        .title
        .as_ref()
        .is_some_and(|t| t.to_lowercase().contains(needle))
}

// -- Row conversion --

fn parse_id(raw: &str) -> anyhow::Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id '{}'", raw))
}

fn profile_from_row(row: ProfileRow) -> anyhow::Result<UserProfile> {
    Ok(UserProfile {
        id: parse_id(&row.id)?,
        full_name: row.full_name,
        avatar_url: row.avatar_url,
        email: row.email,
    })
}

fn attachment_from_row(row: AttachmentRow) -> anyhow::Result<MessageAttachment> {
    Ok(MessageAttachment {
        id: parse_id(&row.id)?,
        message_id: parse_id(&row.message_id)?,
        file_path: row.file_path,
        file_name: row.file_name,
        file_size: row.file_size,
        file_type: row.file_type,
        created_at: time::decode(&row.created_at)?,
    })
}

fn message_from_row(row: MessageRow, attachments: Vec<MessageAttachment>) -> anyhow::Result<Message> {
    Ok(Message {
        id: parse_id(&row.id)?,
        conversation_id: parse_id(&row.conversation_id)?,
        sender_id: parse_id(&row.sender_id)?,
        content: row.content,
        created_at: time::decode(&row.created_at)?,
        has_attachments: row.has_attachments,
        sender: row.sender.map(profile_from_row).transpose()?,
        attachments,
    })
}

fn participant_from_row(row: ParticipantRow) -> anyhow::Result<ConversationParticipant> {
    Ok(ConversationParticipant {
        conversation_id: parse_id(&row.conversation_id)?,
        user_id: parse_id(&row.user_id)?,
        joined_at: time::decode(&row.joined_at)?,
        last_read_message_id: row.last_read_message_id.as_deref().map(parse_id).transpose()?,
        user: row.profile.map(profile_from_row).transpose()?,
    })
}

fn build_conversation(
    row: ConversationRow,
    participants: Vec<ParticipantRow>,
    last_message: Option<Message>,
) -> Result<Conversation> {
    Ok(Conversation {
        id: parse_id(&row.id)?,
        created_at: time::decode(&row.created_at)?,
        updated_at: time::decode(&row.updated_at)?,
        title: row.title,
        is_group: row.is_group,
        participants: participants
            .into_iter()
            .map(participant_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?,
        last_message,
    })
}
