use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Content written over a message when it is deleted.
pub const DELETED_MESSAGE_TOMBSTONE: &str = "This message was deleted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether this message counts as unread for `user_id` given a read
    /// cursor.
    pub fn is_unread_for(&self, user_id: Uuid, last_read_at: Option<DateTime<Utc>>) -> bool {
        if self.sender_id == user_id || self.is_deleted() {
            return false;
        }
        match last_read_at {
            Some(cursor) => self.created_at > cursor,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    File,
    Location,
    System,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Text
    }
}

impl FromStr for MessageType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "location" => Ok(Self::Location),
            "system" => Ok(Self::System),
            _ => Err(AppError::InvalidMessageType),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub metadata: Option<serde_json::Value>,
}

/// Query window over a conversation's history.
#[derive(Debug, Clone, Copy)]
pub struct MessageQuery {
    pub page: u32,
    pub limit: u32,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
}

impl MessageQuery {
    pub fn matches(&self, message: &Message) -> bool {
        self.before.map_or(true, |b| message.created_at < b)
            && self.after.map_or(true, |a| message.created_at > a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub conversation_id: Uuid,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadOverview {
    pub total: i64,
    pub conversations: Vec<UnreadCount>,
}
