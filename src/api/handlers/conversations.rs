use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{ConversationDetails, ConversationSummary, Message, Paginated},
    realtime::events::ReadReceipt,
    services::Claims,
    AppState,
};

use super::super::middleware::get_user_id;

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    #[serde(rename = "type")]
    pub conversation_type: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListConversationsQuery>,
) -> AppResult<Json<Paginated<ConversationSummary>>> {
    let user_id = get_user_id(&claims)?;

    let page = state.chat.page_request(query.page, query.limit);
    let conversations = state
        .chat
        .list_conversations(user_id, page, query.conversation_type.as_deref())
        .await?;

    Ok(Json(conversations))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(rename = "type")]
    pub conversation_type: String,
    pub title: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
    pub incident_id: Option<Uuid>,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> AppResult<Json<ConversationDetails>> {
    let user_id = get_user_id(&claims)?;

    let conversation = state
        .chat
        .create_conversation(
            user_id,
            &req.conversation_type,
            req.title,
            req.participant_ids,
            req.incident_id,
        )
        .await?;

    Ok(Json(conversation))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<ConversationDetails>> {
    let user_id = get_user_id(&claims)?;

    let conversation = state
        .chat
        .get_conversation(conversation_id, user_id)
        .await?;

    Ok(Json(conversation))
}

pub async fn leave_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<ConversationDetails>> {
    let user_id = get_user_id(&claims)?;

    let conversation = state
        .chat
        .leave_conversation(conversation_id, user_id)
        .await?;

    Ok(Json(conversation))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<ReadReceipt>> {
    let user_id = get_user_id(&claims)?;

    let receipt = state.chat.mark_read(conversation_id, user_id).await?;

    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddParticipantsRequest {
    pub participant_ids: Vec<Uuid>,
}

pub async fn add_participants(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<AddParticipantsRequest>,
) -> AppResult<Json<ConversationDetails>> {
    let user_id = get_user_id(&claims)?;

    let conversation = state
        .chat
        .add_participants(conversation_id, user_id, req.participant_ids)
        .await?;

    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> AppResult<Json<Paginated<Message>>> {
    let user_id = get_user_id(&claims)?;

    let page = state.chat.page_request(query.page, query.limit);
    let messages = state
        .chat
        .list_messages(conversation_id, user_id, page, query.before, query.after)
        .await?;

    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    pub message_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let user_id = get_user_id(&claims)?;

    let message = state
        .chat
        .send_message(
            conversation_id,
            user_id,
            req.content,
            req.message_type.as_deref(),
            req.metadata,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}
