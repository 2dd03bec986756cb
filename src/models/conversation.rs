use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Message, Role};
use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub incident_id: Option<Uuid>,
    pub minimum_role: Option<Role>,
    pub status: ConversationStatus,
    pub created_by: Uuid,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Timestamp used to order conversation lists.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "conversation_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Direct,
    Group,
    Incident,
    RoleGroup,
}

impl FromStr for ConversationType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            "incident" => Ok(Self::Incident),
            "role_group" => Ok(Self::RoleGroup),
            _ => Err(AppError::InvalidType),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "conversation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
    Closed,
}

impl Default for ConversationStatus {
    fn default() -> Self {
        Self::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "participant_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Admin,
    Member,
}

/// Lifecycle of a participant row. Rows are never deleted; leaving closes
/// the row and a later join opens a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "at", rename_all = "lowercase")]
pub enum Membership {
    Active,
    Left(DateTime<Utc>),
}

impl Membership {
    pub fn from_left_at(left_at: Option<DateTime<Utc>>) -> Self {
        match left_at {
            Some(at) => Membership::Left(at),
            None => Membership::Active,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Membership::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub membership: Membership,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.membership.is_active()
    }
}

/// Input for conversation creation after request validation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub incident_id: Option<Uuid>,
    pub minimum_role: Option<Role>,
    pub created_by: Uuid,
    pub member_ids: Vec<Uuid>,
}

/// Row of a conversation list: the conversation plus what the caller needs
/// to render it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub last_message: Option<Message>,
    pub unread_count: i64,
    pub participant_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDetails {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
    pub last_message: Option<Message>,
    pub unread_count: i64,
}

/// A role group as seen by a particular caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub participant_count: i64,
    pub is_joined: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_type_parsing() {
        assert_eq!("direct".parse::<ConversationType>().unwrap(), ConversationType::Direct);
        assert_eq!(
            "role_group".parse::<ConversationType>().unwrap(),
            ConversationType::RoleGroup
        );
        assert!(matches!(
            "channel".parse::<ConversationType>(),
            Err(AppError::InvalidType)
        ));
    }

    #[test]
    fn membership_from_left_at() {
        let now = Utc::now();
        assert_eq!(Membership::from_left_at(None), Membership::Active);
        assert_eq!(Membership::from_left_at(Some(now)), Membership::Left(now));
        assert!(!Membership::Left(now).is_active());
    }
}
