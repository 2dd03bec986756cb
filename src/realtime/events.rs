//! Wire events of the realtime channel.
//!
//! Every frame is `{"event": <name>, "data": <payload>}`. `message:new` is
//! used in both directions: the client sends an [`OutgoingMessage`] and the
//! server fans out the stored [`Message`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{Message, Role},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "authenticate")]
    Authenticate(AuthenticatePayload),
    #[serde(rename = "conversation:join")]
    JoinConversation(RoomPayload),
    #[serde(rename = "conversation:leave")]
    LeaveConversation(RoomPayload),
    #[serde(rename = "message:new")]
    SendMessage(OutgoingMessage),
    #[serde(rename = "typing:start")]
    TypingStart(RoomPayload),
    #[serde(rename = "typing:stop")]
    TypingStop(RoomPayload),
    #[serde(rename = "messages:read")]
    MarkRead(RoomPayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Authenticate(_) => "authenticate",
            ClientEvent::JoinConversation(_) => "conversation:join",
            ClientEvent::LeaveConversation(_) => "conversation:leave",
            ClientEvent::SendMessage(_) => "message:new",
            ClientEvent::TypingStart(_) => "typing:start",
            ClientEvent::TypingStop(_) => "typing:stop",
            ClientEvent::MarkRead(_) => "messages:read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "authenticated")]
    Authenticated(AuthenticatedPayload),
    #[serde(rename = "auth_error")]
    AuthError(ErrorPayload),
    #[serde(rename = "conversation:joined")]
    ConversationJoined(RoomPayload),
    #[serde(rename = "conversation:left")]
    ConversationLeft(RoomPayload),
    #[serde(rename = "message:new")]
    MessageNew(Message),
    #[serde(rename = "message:deleted")]
    MessageDeleted(MessageDeletedPayload),
    #[serde(rename = "message:read")]
    MessageRead(ReadReceipt),
    #[serde(rename = "typing:start")]
    TypingStart(TypingPayload),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingPayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatePayload {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedPayload {
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub conversation_id: Uuid,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedPayload {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorPayload {
    fn from(err: &AppError) -> Self {
        ErrorPayload {
            code: err.code().to_string(),
            message: err.public_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_events_use_wire_names() {
        let conversation_id = Uuid::new_v4();
        let event = ClientEvent::JoinConversation(RoomPayload { conversation_id });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"event": "conversation:join", "data": {"conversationId": conversation_id}})
        );
        assert_eq!(event.name(), "conversation:join");
    }

    #[test]
    fn parses_outgoing_message_without_optional_fields() {
        let conversation_id = Uuid::new_v4();
        let frame = json!({
            "event": "message:new",
            "data": {"conversationId": conversation_id, "content": "need help"}
        });
        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(
            event,
            ClientEvent::SendMessage(OutgoingMessage {
                conversation_id,
                content: "need help".to_string(),
                message_type: None,
                metadata: None,
            })
        );
    }

    #[test]
    fn unknown_event_names_are_rejected() {
        let frame = json!({"event": "mesage:new", "data": {}});
        assert!(serde_json::from_value::<ClientEvent>(frame).is_err());
    }

    #[test]
    fn error_payload_carries_stable_code() {
        let payload = ErrorPayload::from(&AppError::AccessDenied);
        let frame = serde_json::to_value(ServerEvent::Error(payload)).unwrap();
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["data"]["code"], "ACCESS_DENIED");
    }
}
