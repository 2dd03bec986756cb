//! Persistence seam for the chat core.
//!
//! Services talk to storage only through [`ConversationStore`] and
//! [`MessageStore`]. Accessors return `Ok(None)` / `Ok(false)` for absent
//! ids; permission decisions belong to the service layer.

pub mod memory;
pub mod postgres;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{
        Conversation, ConversationSummary, ConversationType, Message, MessageQuery, NewConversation,
        NewMessage, PageRequest, Participant, ParticipantRole, Role, UnreadCount,
    },
};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates a conversation with the creator as `admin` and `member_ids`
    /// as members. For direct conversations an existing active conversation
    /// between the same pair is returned instead; the check and the insert
    /// are serialized per user pair.
    async fn create_conversation(&self, new: NewConversation) -> AppResult<Conversation>;

    /// Find-or-create the system group for `role`.
    async fn ensure_role_group(&self, role: Role) -> AppResult<Conversation>;

    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>>;

    async fn list_by_type(&self, conversation_type: ConversationType)
        -> AppResult<Vec<Conversation>>;

    /// Conversations the user actively participates in, most recent activity
    /// first, with last message and unread count. Returns the page and the
    /// total number of matching conversations.
    async fn list_for_user(
        &self,
        user_id: Uuid,
        page: PageRequest,
        type_filter: Option<ConversationType>,
    ) -> AppResult<(Vec<ConversationSummary>, i64)>;

    /// Active participants only.
    async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Participant>>;

    async fn get_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>>;

    /// Adds an active participant row. Returns the active row and whether it
    /// was created by this call.
    async fn add_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
    ) -> AppResult<(Participant, bool)>;

    /// Closes the user's active row. Returns false if there was none.
    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool>;

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool>;

    async fn count_active_participants(&self, conversation_id: Uuid) -> AppResult<i64>;

    /// Moves the read cursor to `max(current, now)`. Returns the new cursor,
    /// or `None` if the user is not an active participant.
    async fn update_last_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<DateTime<Utc>>>;

    async fn incident_exists(&self, incident_id: Uuid) -> AppResult<bool>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message, bumps the conversation activity timestamp and the
    /// sender's read cursor. All three happen or none do.
    async fn send(&self, new: NewMessage) -> AppResult<Message>;

    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>>;

    /// Page of history in chronological order, plus the total matching.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        query: MessageQuery,
    ) -> AppResult<(Vec<Message>, i64)>;

    /// Most recent message that is not deleted.
    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>>;

    /// Replaces content with the tombstone and stamps `deleted_at`. Returns
    /// `None` if the message does not exist or is already deleted.
    async fn soft_delete(&self, id: Uuid) -> AppResult<Option<Message>>;

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64>;

    async fn unread_per_conversation(&self, user_id: Uuid) -> AppResult<Vec<UnreadCount>>;

    async fn unread_total_for_user(&self, user_id: Uuid) -> AppResult<i64> {
        Ok(self
            .unread_per_conversation(user_id)
            .await?
            .iter()
            .map(|u| u.count)
            .sum())
    }
}

pub trait ChatStore: ConversationStore + MessageStore {}

impl<T: ConversationStore + MessageStore> ChatStore for T {}

/// Canonical ordering of a user pair, used to key direct conversations.
pub fn ordered_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
