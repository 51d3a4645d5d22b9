use chrono::{DateTime, Utc};
use uuid::Uuid;

use ledgerdesk_types::models::Message;

/// Whether an entry has been acknowledged by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Shown locally while the send is in flight.
    Pending { temp_id: Uuid },
    Confirmed { id: Uuid },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadEntry {
    pub delivery: Delivery,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub has_attachments: bool,
}

impl ThreadEntry {
    fn confirmed(message: Message) -> Self {
        Self {
            delivery: Delivery::Confirmed { id: message.id },
            sender_id: message.sender_id,
            content: message.content,
            created_at: message.created_at,
            has_attachments: message.has_attachments,
        }
    }

    pub fn confirmed_id(&self) -> Option<Uuid> {
        match self.delivery {
            Delivery::Confirmed { id } => Some(id),
            Delivery::Pending { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending { .. })
    }
}

/// One conversation in display order (oldest first).
///
/// Confirmed entries stay sorted by `created_at`; pending entries sit after
/// them in the order they were started.
#[derive(Debug, Clone)]
pub struct ThreadState {
    conversation_id: Uuid,
    entries: Vec<ThreadEntry>,
    last_read: Option<Uuid>,
}

impl ThreadState {
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            last_read: None,
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn entries(&self) -> &[ThreadEntry] {
        &self.entries
    }

    pub fn last_read(&self) -> Option<Uuid> {
        self.last_read
    }

    pub fn set_last_read(&mut self, message_id: Option<Uuid>) {
        self.last_read = message_id;
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    /// Replace confirmed history with a server page (newest first). Sends
    /// still in flight survive the reload.
    pub fn load(&mut self, page: Vec<Message>) {
        let pending: Vec<ThreadEntry> = self.entries.drain(..).filter(|e| e.is_pending()).collect();
        self.entries = page
            .into_iter()
            .rev()
            .filter(|m| m.conversation_id == self.conversation_id)
            .map(ThreadEntry::confirmed)
            .collect();
        self.entries.extend(pending);
    }

    /// Show `content` immediately and return the id to confirm or reject it with.
    pub fn begin_send(&mut self, sender_id: Uuid, content: &str) -> Uuid {
        let temp_id = Uuid::new_v4();
        self.entries.push(ThreadEntry {
            delivery: Delivery::Pending { temp_id },
            sender_id,
            content: content.to_string(),
            created_at: Utc::now(),
            has_attachments: false,
        });
        temp_id
    }

    /// Swap the pending entry for the stored message. If the realtime bridge
    /// already delivered it, the pending entry is dropped instead. Returns
    /// false when `temp_id` was unknown.
    pub fn confirm(&mut self, temp_id: Uuid, message: Message) -> bool {
        let Some(index) = self.pending_index(temp_id) else {
            self.apply_remote(message);
            return false;
        };

        self.entries.remove(index);
        self.apply_remote(message);
        true
    }

    /// Roll back a failed send. The removed entry is returned so its content
    /// can be restored to the composer.
    pub fn reject(&mut self, temp_id: Uuid) -> Option<ThreadEntry> {
        let index = self.pending_index(temp_id)?;
        Some(self.entries.remove(index))
    }

    /// Insert a message pushed by the server. Returns false if it belongs to
    /// another conversation or is already shown.
    pub fn apply_remote(&mut self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id || self.contains(message.id) {
            return false;
        }

        let index = self
            .entries
            .iter()
            .position(|e| e.is_pending() || e.created_at > message.created_at)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, ThreadEntry::confirmed(message));
        true
    }

    pub fn contains(&self, message_id: Uuid) -> bool {
        self.entries.iter().any(|e| e.confirmed_id() == Some(message_id))
    }

    /// Newest confirmed message from someone other than `user_id` that sits
    /// after the current read pointer.
    pub fn latest_unread_from_others(&self, user_id: Uuid) -> Option<Uuid> {
        let read_index = self
            .last_read
            .and_then(|id| self.entries.iter().position(|e| e.confirmed_id() == Some(id)));

        self.entries
            .iter()
            .enumerate()
            .rev()
            .take_while(|(i, _)| read_index.is_none_or(|r| *i > r))
            .find(|(_, e)| e.sender_id != user_id)
            .and_then(|(_, e)| e.confirmed_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(conversation_id: Uuid, sender_id: Uuid, content: &str, minutes: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content: content.to_string(),
            created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::minutes(minutes),
            has_attachments: false,
            sender: None,
            attachments: Vec::new(),
        }
    }

    fn contents(thread: &ThreadState) -> Vec<&str> {
        thread.entries().iter().map(|e| e.content.as_str()).collect()
    }

    #[test]
    fn load_reverses_page_into_display_order() {
        let conv = Uuid::new_v4();
        let them = Uuid::new_v4();
        let mut thread = ThreadState::new(conv);
        thread.load(vec![
            message(conv, them, "third", 3),
            message(conv, them, "second", 2),
            message(conv, them, "first", 1),
        ]);
        assert_eq!(contents(&thread), ["first", "second", "third"]);
    }

    #[test]
    fn confirm_replaces_pending_entry() {
        let conv = Uuid::new_v4();
        let me = Uuid::new_v4();
        let mut thread = ThreadState::new(conv);

        let temp_id = thread.begin_send(me, "Payment sent");
        assert_eq!(thread.entries()[0].delivery, Delivery::Pending { temp_id });
        assert_eq!(thread.pending_count(), 1);

        let stored = message(conv, me, "Payment sent", 5);
        assert!(thread.confirm(temp_id, stored.clone()));
        assert_eq!(thread.entries().len(), 1);
        assert_eq!(thread.entries()[0].delivery, Delivery::Confirmed { id: stored.id });
        assert_eq!(thread.pending_count(), 0);
    }

    #[test]
    fn confirm_after_realtime_echo_does_not_duplicate() {
        let conv = Uuid::new_v4();
        let me = Uuid::new_v4();
        let mut thread = ThreadState::new(conv);

        let temp_id = thread.begin_send(me, "Hello");
        let stored = message(conv, me, "Hello", 1);
        assert!(thread.apply_remote(stored.clone()));
        assert!(thread.confirm(temp_id, stored.clone()));

        assert_eq!(thread.entries().len(), 1);
        assert!(thread.contains(stored.id));
    }

    #[test]
    fn reject_rolls_back_only_that_send() {
        let conv = Uuid::new_v4();
        let me = Uuid::new_v4();
        let mut thread = ThreadState::new(conv);

        let failed = thread.begin_send(me, "will fail");
        let kept = thread.begin_send(me, "still going");

        let removed = thread.reject(failed).unwrap();
        assert_eq!(removed.content, "will fail");
        assert!(thread.reject(failed).is_none());
        assert_eq!(thread.entries().len(), 1);
        assert_eq!(thread.entries()[0].delivery, Delivery::Pending { temp_id: kept });
    }

    #[test]
    fn remote_messages_land_before_pending_and_in_time_order() {
        let conv = Uuid::new_v4();
        let me = Uuid::new_v4();
        let them = Uuid::new_v4();
        let mut thread = ThreadState::new(conv);

        thread.load(vec![message(conv, them, "late", 10), message(conv, them, "early", 1)]);
        thread.begin_send(me, "typing");

        assert!(thread.apply_remote(message(conv, them, "middle", 5)));
        assert!(thread.apply_remote(message(conv, them, "newest", 20)));
        assert!(!thread.apply_remote(message(Uuid::new_v4(), them, "elsewhere", 30)));

        assert_eq!(contents(&thread), ["early", "middle", "late", "newest", "typing"]);
    }

    #[test]
    fn reload_keeps_in_flight_sends() {
        let conv = Uuid::new_v4();
        let me = Uuid::new_v4();
        let mut thread = ThreadState::new(conv);

        thread.begin_send(me, "draft");
        thread.load(vec![message(conv, me, "older", 1)]);
        assert_eq!(contents(&thread), ["older", "draft"]);
    }

    #[test]
    fn latest_unread_skips_own_messages_and_read_pointer() {
        let conv = Uuid::new_v4();
        let me = Uuid::new_v4();
        let them = Uuid::new_v4();
        let mut thread = ThreadState::new(conv);
        assert_eq!(thread.latest_unread_from_others(me), None);

        let theirs = message(conv, them, "question", 1);
        let mine = message(conv, me, "answer", 2);
        thread.load(vec![mine.clone(), theirs.clone()]);

        assert_eq!(thread.latest_unread_from_others(me), Some(theirs.id));
        assert_eq!(thread.latest_unread_from_others(them), Some(mine.id));

        thread.set_last_read(Some(theirs.id));
        assert_eq!(thread.latest_unread_from_others(me), None);
    }
}
