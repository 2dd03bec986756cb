//! Real-time chat backend for the rider safety app: conversations, messages,
//! unread tracking, role-based group channels and the realtime gateway.

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod realtime;
pub mod services;
pub mod storage;

use config::Config;
use realtime::{hub::RoomHub, session::Session};
use services::{AuthService, MessagingService, RoleGroupResolver, UnreadTracker};
use storage::ChatStore;

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<MessagingService>,
    pub groups: Arc<RoleGroupResolver>,
    pub unread: Arc<UnreadTracker>,
    pub auth: Arc<AuthService>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Arc<dyn ChatStore>, hub: Arc<RoomHub>, config: Config) -> Self {
        Self {
            chat: Arc::new(MessagingService::new(
                store.clone(),
                hub,
                config.chat.clone(),
            )),
            groups: Arc::new(RoleGroupResolver::new(store.clone())),
            unread: Arc::new(UnreadTracker::new(store)),
            auth: Arc::new(AuthService::new(config.jwt.clone())),
            config: Arc::new(config),
        }
    }

    /// Server side of a new realtime connection.
    pub fn session(&self) -> Session {
        Session::new(
            self.chat.clone(),
            self.auth.clone(),
            self.config.realtime.auth_timeout,
        )
    }
}

/// Full HTTP application: health check plus the versioned API.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api::router::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
