use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::JwtConfig,
    error::{AppError, AppResult},
    models::Role,
};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // user_id
    pub role: Role,
    pub iss: String, // issuer
    pub exp: i64,    // expiry
    pub iat: i64,    // issued at
}

impl Claims {
    pub fn user_id(&self) -> AppResult<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::InvalidToken)
    }
}

/// Issues and validates access tokens. Users and role approval live in the
/// account service; this side only trusts what a valid token says.
pub struct AuthService {
    config: JwtConfig,
}

impl AuthService {
    pub fn new(config: JwtConfig) -> Self {
        Self { config }
    }

    pub fn issue_access_token(&self, user_id: Uuid, role: Role) -> AppResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            iss: self.config.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.config.access_token_ttl.as_secs() as i64))
                .timestamp(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.secret.as_bytes()),
        )?;
        Ok(token)
    }

    pub fn validate_token(&self, token: &str) -> AppResult<Claims> {
        let key = DecodingKey::from_secret(self.config.secret.as_bytes());
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.config.issuer]);
        validation.leeway = 0;

        let token_data = decode::<Claims>(token, &key, &validation)?;
        Ok(token_data.claims)
    }
}
