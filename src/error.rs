use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    // Auth errors
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid token")]
    InvalidToken,

    // Validation errors
    #[error("Invalid conversation type")]
    InvalidType,
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Direct conversations require exactly one other participant")]
    DirectRequiresOneParticipant,
    #[error("Group conversations require at least one other participant")]
    GroupRequiresParticipants,
    #[error("Incident conversations require an incident id")]
    IncidentRequired,
    #[error("Validation error: {0}")]
    Validation(String),

    // Authorization errors
    #[error("Access denied")]
    AccessDenied,
    #[error("Insufficient role for this group")]
    InsufficientRole,
    #[error("Not a role-based group")]
    NotARoleBasedGroup,

    // Not found errors
    #[error("Conversation not found")]
    ConversationNotFound,
    #[error("Message not found")]
    MessageNotFound,
    #[error("Incident not found")]
    IncidentNotFound,

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // JWT errors
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    // Internal errors
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.into())
    }
}

impl AppError {
    /// Stable machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::InvalidToken | AppError::Jwt(_) => "INVALID_TOKEN",
            AppError::InvalidType => "INVALID_TYPE",
            AppError::InvalidMessageType => "INVALID_MESSAGE_TYPE",
            AppError::DirectRequiresOneParticipant => "DIRECT_REQUIRES_ONE_PARTICIPANT",
            AppError::GroupRequiresParticipants => "GROUP_REQUIRES_PARTICIPANTS",
            AppError::IncidentRequired => "INCIDENT_ID_REQUIRED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::AccessDenied => "ACCESS_DENIED",
            AppError::InsufficientRole => "INSUFFICIENT_ROLE",
            AppError::NotARoleBasedGroup => "NOT_A_ROLE_BASED_GROUP",
            AppError::ConversationNotFound => "CONVERSATION_NOT_FOUND",
            AppError::MessageNotFound => "MESSAGE_NOT_FOUND",
            AppError::IncidentNotFound => "INCIDENT_NOT_FOUND",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Redis(_) => "CACHE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::InvalidType
            | AppError::InvalidMessageType
            | AppError::DirectRequiresOneParticipant
            | AppError::GroupRequiresParticipants
            | AppError::IncidentRequired
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::Unauthorized | AppError::InvalidToken | AppError::Jwt(_) => {
                StatusCode::UNAUTHORIZED
            }

            // 403 Forbidden
            AppError::AccessDenied | AppError::InsufficientRole | AppError::NotARoleBasedGroup => {
                StatusCode::FORBIDDEN
            }

            // 404 Not Found
            AppError::ConversationNotFound
            | AppError::MessageNotFound
            | AppError::IncidentNotFound => StatusCode::NOT_FOUND,

            // 500 Internal Server Error
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show to a client. Infrastructure failures are logged
    /// here and replaced by a generic text.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Jwt(_) => "Invalid token".to_string(),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "Database error".to_string()
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                "Cache error".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.public_message(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(AppError::InvalidType.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::InsufficientRole.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::NotARoleBasedGroup.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::ConversationNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(
            AppError::DirectRequiresOneParticipant.code(),
            "DIRECT_REQUIRES_ONE_PARTICIPANT"
        );
        assert_eq!(AppError::GroupRequiresParticipants.code(), "GROUP_REQUIRES_PARTICIPANTS");
        assert_eq!(AppError::AccessDenied.code(), "ACCESS_DENIED");
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err = AppError::Internal(anyhow::anyhow!("connection string with password"));
        assert_eq!(err.public_message(), "Internal server error");
    }
}
