use std::sync::Arc;

use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{Conversation, ConversationType, GroupSummary, ParticipantRole, Role},
    storage::ChatStore,
};

/// Visibility and membership of the system-wide role groups.
///
/// A group with minimum role `R` is open to every role at or above `R`.
pub struct RoleGroupResolver {
    store: Arc<dyn ChatStore>,
}

impl RoleGroupResolver {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Creates any missing role group. Safe to run on every start.
    pub async fn ensure_bootstrapped(&self) -> AppResult<Vec<Conversation>> {
        let mut groups = Vec::with_capacity(Role::GROUP_ROLES.len());
        for role in Role::GROUP_ROLES {
            groups.push(self.store.ensure_role_group(role).await?);
        }
        tracing::info!("Role groups ready: {}", groups.len());
        Ok(groups)
    }

    /// Groups the role may see, lowest minimum role first.
    pub async fn list_accessible(&self, user_id: Uuid, role: Role) -> AppResult<Vec<GroupSummary>> {
        let mut groups = self.accessible(role).await?;
        groups.sort_by_key(|c| c.minimum_role);

        let mut summaries = Vec::with_capacity(groups.len());
        for conversation in groups {
            summaries.push(self.summary(conversation, user_id).await?);
        }
        Ok(summaries)
    }

    /// Joins a role group. Joining a group the user is already in is a no-op.
    /// Returns the group as the caller now sees it.
    pub async fn join(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> AppResult<GroupSummary> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::ConversationNotFound)?;

        let minimum_role = match (conversation.conversation_type, conversation.minimum_role) {
            (ConversationType::RoleGroup, Some(minimum)) => minimum,
            _ => return Err(AppError::NotARoleBasedGroup),
        };
        if !role.satisfies(minimum_role) {
            return Err(AppError::InsufficientRole);
        }

        let (_, created) = self
            .store
            .add_participant(conversation_id, user_id, ParticipantRole::Member)
            .await?;
        if created {
            tracing::info!(
                "User {} ({}, level {}) joined role group {}",
                user_id,
                role,
                role.level(),
                minimum_role
            );
        }

        self.summary(conversation, user_id).await
    }

    /// Joins every accessible group the user is not in yet. Returns how many
    /// were joined by this call.
    pub async fn auto_join_all(&self, user_id: Uuid, role: Role) -> AppResult<usize> {
        let mut joined = 0;
        for conversation in self.accessible(role).await? {
            let (_, created) = self
                .store
                .add_participant(conversation.id, user_id, ParticipantRole::Member)
                .await?;
            if created {
                joined += 1;
            }
        }

        if joined > 0 {
            tracing::info!("Auto-joined user {} ({}) to {} role groups", user_id, role, joined);
        }
        Ok(joined)
    }

    async fn summary(&self, conversation: Conversation, user_id: Uuid) -> AppResult<GroupSummary> {
        let participant_count = self.store.count_active_participants(conversation.id).await?;
        let is_joined = self.store.is_participant(conversation.id, user_id).await?;
        Ok(GroupSummary {
            conversation,
            participant_count,
            is_joined,
        })
    }

    async fn accessible(&self, role: Role) -> AppResult<Vec<Conversation>> {
        let groups = self.store.list_by_type(ConversationType::RoleGroup).await?;
        Ok(groups
            .into_iter()
            .filter(|c| c.minimum_role.map_or(false, |min| role.satisfies(min)))
            .collect())
    }
}
