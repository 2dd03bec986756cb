use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};

use super::{handlers, middleware::auth_middleware, websocket::handle_websocket};
use crate::AppState;

pub fn create_router(state: AppState) -> Router<AppState> {
    // Conversation routes (protected)
    let conversation_routes = Router::new()
        .route("/", get(handlers::conversations::list_conversations))
        .route("/", post(handlers::conversations::create_conversation))
        .route("/:id", get(handlers::conversations::get_conversation))
        .route("/:id", delete(handlers::conversations::leave_conversation))
        .route("/:id/read", patch(handlers::conversations::mark_read))
        .route("/:id/messages", get(handlers::conversations::list_messages))
        .route("/:id/messages", post(handlers::conversations::send_message))
        .route("/:id/participants", post(handlers::conversations::add_participants))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Message routes (protected)
    let message_routes = Router::new()
        .route("/:id", delete(handlers::messages::delete_message))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Unread counts and role groups (protected)
    let chat_routes = Router::new()
        .route("/unread-count", get(handlers::chat::unread_count))
        .route("/groups", get(handlers::chat::list_groups))
        .route("/groups/auto-join", post(handlers::chat::auto_join))
        .route("/groups/:id/join", post(handlers::chat::join_group))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // WebSocket route, authenticated in-band
    let ws_route = Router::new().route("/ws", get(handle_websocket));

    // Combine all routes
    Router::new()
        .nest("/conversations", conversation_routes)
        .nest("/messages", message_routes)
        .nest("/chat", chat_routes)
        .merge(ws_route)
        .with_state(state)
}
