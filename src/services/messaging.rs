use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    config::ChatConfig,
    error::{AppError, AppResult},
    models::{
        Conversation, ConversationDetails, ConversationSummary, ConversationType, Message,
        MessageQuery, MessageType, NewConversation, NewMessage, PageRequest, Paginated,
        ParticipantRole,
    },
    realtime::{
        events::{MessageDeletedPayload, ReadReceipt, ServerEvent},
        hub::RoomHub,
    },
    storage::ChatStore,
};

/// Conversation and message operations on behalf of an authenticated user.
/// Every mutation other participants must see is pushed through the hub.
pub struct MessagingService {
    store: Arc<dyn ChatStore>,
    hub: Arc<RoomHub>,
    config: ChatConfig,
}

impl MessagingService {
    pub fn new(store: Arc<dyn ChatStore>, hub: Arc<RoomHub>, config: ChatConfig) -> Self {
        Self { store, hub, config }
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    pub fn page_request(&self, page: Option<u32>, limit: Option<u32>) -> PageRequest {
        PageRequest::new(
            page,
            limit,
            self.config.default_page_size,
            self.config.max_page_size,
        )
    }

    /// Create a conversation, or return the existing direct conversation
    /// between the caller and the single target.
    pub async fn create_conversation(
        &self,
        user_id: Uuid,
        conversation_type: &str,
        title: Option<String>,
        participant_ids: Vec<Uuid>,
        incident_id: Option<Uuid>,
    ) -> AppResult<ConversationDetails> {
        let conversation_type: ConversationType = conversation_type.parse()?;

        let mut others: Vec<Uuid> = Vec::with_capacity(participant_ids.len());
        for id in &participant_ids {
            if *id != user_id && !others.contains(id) {
                others.push(*id);
            }
        }

        let new = match conversation_type {
            ConversationType::Direct => {
                if participant_ids.len() != 1 || others.len() != 1 {
                    return Err(AppError::DirectRequiresOneParticipant);
                }
                NewConversation {
                    conversation_type,
                    title: None,
                    incident_id: None,
                    minimum_role: None,
                    created_by: user_id,
                    member_ids: others,
                }
            }
            ConversationType::Group => {
                if others.is_empty() {
                    return Err(AppError::GroupRequiresParticipants);
                }
                NewConversation {
                    conversation_type,
                    title,
                    incident_id: None,
                    minimum_role: None,
                    created_by: user_id,
                    member_ids: others,
                }
            }
            ConversationType::Incident => {
                let incident_id = incident_id.ok_or(AppError::IncidentRequired)?;
                if !self.store.incident_exists(incident_id).await? {
                    return Err(AppError::IncidentNotFound);
                }
                NewConversation {
                    conversation_type,
                    title,
                    incident_id: Some(incident_id),
                    minimum_role: None,
                    created_by: user_id,
                    member_ids: others,
                }
            }
            // Role groups only come from bootstrap.
            ConversationType::RoleGroup => return Err(AppError::InvalidType),
        };

        let conversation = self.store.create_conversation(new).await?;
        tracing::info!(
            "Conversation {} ({:?}) ready for user {}",
            conversation.id,
            conversation.conversation_type,
            user_id
        );

        self.details(conversation, user_id).await
    }

    /// Get conversation with details
    pub async fn get_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<ConversationDetails> {
        let conversation = self.ensure_access(conversation_id, user_id).await?;
        self.details(conversation, user_id).await
    }

    /// Get user's conversations
    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        page: PageRequest,
        type_filter: Option<&str>,
    ) -> AppResult<Paginated<ConversationSummary>> {
        let type_filter = type_filter
            .map(str::parse::<ConversationType>)
            .transpose()?;

        let (items, total) = self.store.list_for_user(user_id, page, type_filter).await?;
        Ok(Paginated::new(items, page.page, page.limit, total))
    }

    /// Leave a conversation. The participant row is closed, never deleted.
    pub async fn leave_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<ConversationDetails> {
        let conversation = self.ensure_access(conversation_id, user_id).await?;
        self.store.remove_participant(conversation_id, user_id).await?;
        self.hub.evict_user(conversation_id, user_id).await;
        tracing::info!("User {} left conversation {}", user_id, conversation_id);

        self.details(conversation, user_id).await
    }

    /// Add members to a group or incident conversation. Only conversation
    /// admins may do this.
    pub async fn add_participants(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        participant_ids: Vec<Uuid>,
    ) -> AppResult<ConversationDetails> {
        let conversation = self.ensure_access(conversation_id, user_id).await?;
        if !matches!(
            conversation.conversation_type,
            ConversationType::Group | ConversationType::Incident
        ) {
            return Err(AppError::InvalidType);
        }
        if participant_ids.is_empty() {
            return Err(AppError::Validation(
                "participantIds must not be empty".to_string(),
            ));
        }

        let caller = self
            .store
            .get_participant(conversation_id, user_id)
            .await?
            .ok_or(AppError::AccessDenied)?;
        if caller.role != ParticipantRole::Admin {
            return Err(AppError::AccessDenied);
        }

        for participant_id in participant_ids {
            self.store
                .add_participant(conversation_id, participant_id, ParticipantRole::Member)
                .await?;
        }

        self.details(conversation, user_id).await
    }

    /// Move the caller's read cursor to now and tell the room.
    pub async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<ReadReceipt> {
        self.ensure_access(conversation_id, user_id).await?;
        let read_at = self
            .store
            .update_last_read(conversation_id, user_id)
            .await?
            .ok_or(AppError::AccessDenied)?;

        let receipt = ReadReceipt {
            conversation_id,
            user_id,
            read_at,
        };
        self.hub
            .broadcast(conversation_id, ServerEvent::MessageRead(receipt))
            .await;

        Ok(receipt)
    }

    /// Get messages for a conversation, oldest first.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        page: PageRequest,
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
    ) -> AppResult<Paginated<Message>> {
        self.ensure_access(conversation_id, user_id).await?;

        let query = MessageQuery {
            page: page.page,
            limit: page.limit,
            before,
            after,
        };
        let (messages, total) = self.store.list_messages(conversation_id, query).await?;
        Ok(Paginated::new(messages, page.page, page.limit, total))
    }

    /// Send a message
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
        message_type: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<Message> {
        let message_type = match message_type {
            Some(raw) => raw.parse::<MessageType>()?,
            None => MessageType::default(),
        };
        if content.trim().is_empty() {
            return Err(AppError::Validation("content must not be empty".to_string()));
        }

        self.ensure_access(conversation_id, sender_id).await?;

        let message = self
            .store
            .send(NewMessage {
                conversation_id,
                sender_id,
                content,
                message_type,
                metadata,
            })
            .await?;
        tracing::debug!("Message {} sent to {}", message.id, conversation_id);

        // Notify participants
        self.hub
            .broadcast(conversation_id, ServerEvent::MessageNew(message.clone()))
            .await;

        Ok(message)
    }

    /// Delete a message (soft delete). Only the sender may delete.
    pub async fn delete_message(&self, message_id: Uuid, user_id: Uuid) -> AppResult<Message> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .filter(|m| !m.is_deleted())
            .ok_or(AppError::MessageNotFound)?;
        if message.sender_id != user_id {
            return Err(AppError::AccessDenied);
        }

        let deleted = self
            .store
            .soft_delete(message_id)
            .await?
            .ok_or(AppError::MessageNotFound)?;

        self.hub
            .broadcast(
                deleted.conversation_id,
                ServerEvent::MessageDeleted(MessageDeletedPayload {
                    conversation_id: deleted.conversation_id,
                    message_id,
                }),
            )
            .await;

        Ok(deleted)
    }

    /// Conversation must exist and the user must be an active participant.
    pub async fn ensure_access(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Conversation> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::ConversationNotFound)?;

        if !self.store.is_participant(conversation_id, user_id).await? {
            return Err(AppError::AccessDenied);
        }

        Ok(conversation)
    }

    async fn details(
        &self,
        conversation: Conversation,
        user_id: Uuid,
    ) -> AppResult<ConversationDetails> {
        let participants = self.store.participants(conversation.id).await?;
        let last_message = self.store.last_message(conversation.id).await?;
        let unread_count = self.store.unread_count(conversation.id, user_id).await?;

        Ok(ConversationDetails {
            conversation,
            participants,
            last_message,
            unread_count,
        })
    }
}
