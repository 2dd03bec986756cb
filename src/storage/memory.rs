//! In-memory chat store.
//!
//! A single mutex serializes every operation, which makes the
//! direct-conversation check-and-create atomic. Timestamps come from a
//! strictly increasing clock so read cursors compare cleanly.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ConversationStore, MessageStore};
use crate::{
    error::{AppError, AppResult},
    models::{
        Conversation, ConversationStatus, ConversationSummary, ConversationType, Membership,
        Message, MessageQuery, NewConversation, NewMessage, PageRequest, Participant,
        ParticipantRole, Role, UnreadCount, DELETED_MESSAGE_TOMBSTONE,
    },
};

#[derive(Default)]
pub struct MemoryChatStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    conversations: HashMap<Uuid, Conversation>,
    participants: Vec<Participant>,
    messages: Vec<Message>,
    message_index: HashMap<Uuid, usize>,
    incidents: HashSet<Uuid>,
    last_tick: Option<DateTime<Utc>>,
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_tick {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_tick = Some(next);
        next
    }

    fn active_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| {
            p.conversation_id == conversation_id && p.user_id == user_id && p.is_active()
        })
    }

    fn active_participant_mut(
        &mut self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| {
            p.conversation_id == conversation_id && p.user_id == user_id && p.is_active()
        })
    }

    fn active_count(&self, conversation_id: Uuid) -> i64 {
        self.participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id && p.is_active())
            .count() as i64
    }

    fn insert_participant(
        &mut self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
    ) -> Participant {
        let participant = Participant {
            id: Uuid::new_v4(),
            conversation_id,
            user_id,
            role,
            joined_at: self.tick(),
            membership: Membership::Active,
            last_read_at: None,
        };
        self.participants.push(participant.clone());
        participant
    }

    fn find_direct(&self, a: Uuid, b: Uuid) -> Option<&Conversation> {
        self.conversations.values().find(|c| {
            c.conversation_type == ConversationType::Direct
                && c.status == ConversationStatus::Active
                && self.active_participant(c.id, a).is_some()
                && self.active_participant(c.id, b).is_some()
                && self.active_count(c.id) == 2
        })
    }

    fn new_conversation(&mut self, new: &NewConversation) -> Conversation {
        let now = self.tick();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            conversation_type: new.conversation_type,
            title: new.title.clone(),
            incident_id: new.incident_id,
            minimum_role: new.minimum_role,
            status: ConversationStatus::Active,
            created_by: new.created_by,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        self.conversations.insert(conversation.id, conversation.clone());
        conversation
    }

    fn last_message(&self, conversation_id: Uuid) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.conversation_id == conversation_id && !m.is_deleted())
    }

    fn unread(&self, conversation_id: Uuid, user_id: Uuid) -> i64 {
        let Some(participant) = self.active_participant(conversation_id, user_id) else {
            return 0;
        };
        self.messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.is_unread_for(user_id, participant.last_read_at)
            })
            .count() as i64
    }
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an incident id as valid for incident conversations.
    pub async fn register_incident(&self, incident_id: Uuid) {
        self.state.lock().await.incidents.insert(incident_id);
    }
}

#[async_trait]
impl ConversationStore for MemoryChatStore {
    async fn create_conversation(&self, new: NewConversation) -> AppResult<Conversation> {
        let mut state = self.state.lock().await;

        if new.conversation_type == ConversationType::Direct {
            let other = *new
                .member_ids
                .first()
                .ok_or(AppError::DirectRequiresOneParticipant)?;
            if let Some(existing) = state.find_direct(new.created_by, other) {
                return Ok(existing.clone());
            }
        }

        let conversation = state.new_conversation(&new);
        state.insert_participant(conversation.id, new.created_by, ParticipantRole::Admin);

        let mut seen = HashSet::from([new.created_by]);
        for member_id in &new.member_ids {
            if seen.insert(*member_id) {
                state.insert_participant(conversation.id, *member_id, ParticipantRole::Member);
            }
        }

        Ok(conversation)
    }

    async fn ensure_role_group(&self, role: Role) -> AppResult<Conversation> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.conversations.values().find(|c| {
            c.conversation_type == ConversationType::RoleGroup && c.minimum_role == Some(role)
        }) {
            return Ok(existing.clone());
        }

        let new = NewConversation {
            conversation_type: ConversationType::RoleGroup,
            title: Some(role.group_title().to_string()),
            incident_id: None,
            minimum_role: Some(role),
            created_by: Uuid::nil(),
            member_ids: Vec::new(),
        };
        Ok(state.new_conversation(&new))
    }

    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        Ok(self.state.lock().await.conversations.get(&id).cloned())
    }

    async fn list_by_type(
        &self,
        conversation_type: ConversationType,
    ) -> AppResult<Vec<Conversation>> {
        let state = self.state.lock().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.conversation_type == conversation_type)
            .cloned()
            .collect();
        conversations.sort_by_key(|c| (c.minimum_role, c.created_at));
        Ok(conversations)
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        page: PageRequest,
        type_filter: Option<ConversationType>,
    ) -> AppResult<(Vec<ConversationSummary>, i64)> {
        let state = self.state.lock().await;

        let mut conversations: Vec<&Conversation> = state
            .conversations
            .values()
            .filter(|c| type_filter.map_or(true, |t| c.conversation_type == t))
            .filter(|c| state.active_participant(c.id, user_id).is_some())
            .collect();
        conversations.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));

        let total = conversations.len() as i64;
        let items = conversations
            .into_iter()
            .skip(page.offset())
            .take(page.limit as usize)
            .map(|c| ConversationSummary {
                conversation: c.clone(),
                last_message: state.last_message(c.id).cloned(),
                unread_count: state.unread(c.id, user_id),
                participant_count: state.active_count(c.id),
            })
            .collect();

        Ok((items, total))
    }

    async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Participant>> {
        let state = self.state.lock().await;
        Ok(state
            .participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id && p.is_active())
            .cloned()
            .collect())
    }

    async fn get_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>> {
        let state = self.state.lock().await;
        Ok(state.active_participant(conversation_id, user_id).cloned())
    }

    async fn add_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
    ) -> AppResult<(Participant, bool)> {
        let mut state = self.state.lock().await;
        if !state.conversations.contains_key(&conversation_id) {
            return Err(AppError::ConversationNotFound);
        }
        if let Some(existing) = state.active_participant(conversation_id, user_id) {
            return Ok((existing.clone(), false));
        }
        Ok((state.insert_participant(conversation_id, user_id, role), true))
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        let now = state.tick();
        match state.active_participant_mut(conversation_id, user_id) {
            Some(participant) => {
                participant.membership = Membership::Left(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let state = self.state.lock().await;
        Ok(state.active_participant(conversation_id, user_id).is_some())
    }

    async fn count_active_participants(&self, conversation_id: Uuid) -> AppResult<i64> {
        Ok(self.state.lock().await.active_count(conversation_id))
    }

    async fn update_last_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<DateTime<Utc>>> {
        let mut state = self.state.lock().await;
        let now = state.tick();
        Ok(state
            .active_participant_mut(conversation_id, user_id)
            .map(|participant| {
                let cursor = participant.last_read_at.map_or(now, |current| current.max(now));
                participant.last_read_at = Some(cursor);
                cursor
            }))
    }

    async fn incident_exists(&self, incident_id: Uuid) -> AppResult<bool> {
        Ok(self.state.lock().await.incidents.contains(&incident_id))
    }
}

#[async_trait]
impl MessageStore for MemoryChatStore {
    async fn send(&self, new: NewMessage) -> AppResult<Message> {
        let mut state = self.state.lock().await;
        if !state.conversations.contains_key(&new.conversation_id) {
            return Err(AppError::ConversationNotFound);
        }

        let created_at = state.tick();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: new.content,
            message_type: new.message_type,
            metadata: new.metadata,
            created_at,
            deleted_at: None,
        };

        if let Some(conversation) = state.conversations.get_mut(&new.conversation_id) {
            conversation.last_message_at = Some(created_at);
            conversation.updated_at = created_at;
        }
        if let Some(sender) = state.active_participant_mut(new.conversation_id, new.sender_id) {
            sender.last_read_at = Some(sender.last_read_at.map_or(created_at, |c| c.max(created_at)));
        }

        let index = state.messages.len();
        state.message_index.insert(message.id, index);
        state.messages.push(message.clone());

        Ok(message)
    }

    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>> {
        let state = self.state.lock().await;
        Ok(state
            .message_index
            .get(&id)
            .map(|&index| state.messages[index].clone()))
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        query: MessageQuery,
    ) -> AppResult<(Vec<Message>, i64)> {
        let state = self.state.lock().await;
        let matching: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id && query.matches(m))
            .collect();

        let total = matching.len() as i64;
        let offset = (query.page.max(1) as usize - 1) * query.limit as usize;

        // Pages count back from the newest message; each page is then shown
        // oldest first.
        let mut page: Vec<Message> = matching
            .into_iter()
            .rev()
            .skip(offset)
            .take(query.limit as usize)
            .cloned()
            .collect();
        page.reverse();

        Ok((page, total))
    }

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>> {
        Ok(self.state.lock().await.last_message(conversation_id).cloned())
    }

    async fn soft_delete(&self, id: Uuid) -> AppResult<Option<Message>> {
        let mut state = self.state.lock().await;
        let Some(&index) = state.message_index.get(&id) else {
            return Ok(None);
        };
        if state.messages[index].is_deleted() {
            return Ok(None);
        }

        let now = state.tick();
        let message = &mut state.messages[index];
        message.content = DELETED_MESSAGE_TOMBSTONE.to_string();
        message.metadata = None;
        message.deleted_at = Some(now);
        Ok(Some(message.clone()))
    }

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        Ok(self.state.lock().await.unread(conversation_id, user_id))
    }

    async fn unread_per_conversation(&self, user_id: Uuid) -> AppResult<Vec<UnreadCount>> {
        let state = self.state.lock().await;
        let mut counts: Vec<UnreadCount> = state
            .participants
            .iter()
            .filter(|p| p.user_id == user_id && p.is_active())
            .map(|p| UnreadCount {
                conversation_id: p.conversation_id,
                count: state.unread(p.conversation_id, user_id),
            })
            .filter(|u| u.count > 0)
            .collect();
        counts.sort_by_key(|u| u.conversation_id);
        Ok(counts)
    }
}
