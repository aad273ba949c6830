//! Identity and role context. Sessions are issued by the campus SSO as
//! HS256 bearer tokens; this module only resolves the acting user and
//! enforces role preconditions, it does not own credentials.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderMap};
use axum::routing::get;
use axum::{async_trait, Json, Router};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::shared::error::ApiError;
use crate::shared::models::Role;
use crate::shared::state::AppState;

/// JWT claims carried by every authenticated request and websocket upgrade.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,
    pub role: String,
    pub department_id: Option<Uuid>,
    pub exp: i64,
    pub iat: i64,
}

/// The resolved acting user for one request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CurrentUser {
    pub id: Uuid,
    pub role: Role,
    pub department_id: Option<Uuid>,
}

impl CurrentUser {
    /// Role gate composed before mutating operations.
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), ApiError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(ApiError::AccessDenied)
        }
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| {
            if auth.to_lowercase().starts_with("bearer ") {
                Some(auth[7..].to_string())
            } else {
                None
            }
        })
}

pub fn issue_token(user: &CurrentUser, config: &AuthConfig) -> Result<String, ApiError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id,
        role: user.role.to_string(),
        department_id: user.department_id,
        exp: (now + Duration::hours(config.jwt_expiry_hours)).timestamp(),
        iat: now.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(e.into()))
}

pub fn decode_token(token: &str, config: &AuthConfig) -> Result<CurrentUser, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthenticated)?;
    let role = Role::from_str(&data.claims.role).map_err(|_| ApiError::Unauthenticated)?;
    Ok(CurrentUser {
        id: data.claims.sub,
        role,
        department_id: data.claims.department_id,
    })
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers).ok_or(ApiError::Unauthenticated)?;
        decode_token(&token, &state.config.auth)
    }
}

async fn me(user: CurrentUser) -> Json<CurrentUser> {
    Json(user)
}

pub fn configure_auth_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/auth/me", get(me))
}
