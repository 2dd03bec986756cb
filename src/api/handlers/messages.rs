use axum::{
    extract::{Path, State},
    Extension, Json,
};
use uuid::Uuid;

use crate::{error::AppResult, models::Message, services::Claims, AppState};

use super::super::middleware::get_user_id;

/// Soft-deletes one of the caller's messages and returns the tombstone.
pub async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<Message>> {
    let user_id = get_user_id(&claims)?;

    let message = state.chat.delete_message(message_id, user_id).await?;

    Ok(Json(message))
}
