use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{GroupSummary, Paginated, UnreadOverview},
    services::Claims,
    AppState,
};

use super::super::middleware::get_user_id;

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<UnreadOverview>> {
    let user_id = get_user_id(&claims)?;

    let overview = state.unread.overview(user_id).await?;

    Ok(Json(overview))
}

#[derive(Debug, Deserialize)]
pub struct GroupsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn list_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<GroupsQuery>,
) -> AppResult<Json<Paginated<GroupSummary>>> {
    let user_id = get_user_id(&claims)?;

    let page = state.chat.page_request(query.page, query.limit);
    let groups = state.groups.list_accessible(user_id, claims.role).await?;
    let total = groups.len() as i64;
    let data = groups
        .into_iter()
        .skip(page.offset())
        .take(page.limit as usize)
        .collect();

    Ok(Json(Paginated::new(data, page.page, page.limit, total)))
}

pub async fn join_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<GroupSummary>> {
    let user_id = get_user_id(&claims)?;

    let group = state
        .groups
        .join(conversation_id, user_id, claims.role)
        .await?;

    Ok(Json(group))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoJoinResponse {
    pub joined_count: usize,
}

pub async fn auto_join(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<AutoJoinResponse>> {
    let user_id = get_user_id(&claims)?;

    let joined_count = state.groups.auto_join_all(user_id, claims.role).await?;

    Ok(Json(AutoJoinResponse { joined_count }))
}
