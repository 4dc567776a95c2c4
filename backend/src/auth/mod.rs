use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
};
use axum_extra::extract::CookieJar;
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::config_loader;

/// Cookie set by the login flow; used when no Authorization header is present.
pub const STUDENT_TOKEN_COOKIE: &str = "studentToken";
pub const ADMIN_ROLE: &str = "admin";
pub const STUDENT_ROLE: &str = "student";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

#[derive(Debug, Clone)]
pub struct AuthStudent {
    pub student_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct AuthAdmin {
    pub admin_id: Uuid,
}

#[derive(Debug)]
pub struct AuthError(anyhow::Error);

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        AuthError(err)
    }
}

pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);

    let token_data = decode::<Claims>(token, &decoding_key, &validation)
        .map_err(|e| anyhow::anyhow!("JWT validation failed: {}", e))?;

    Ok(token_data.claims)
}

fn bearer_or_cookie(parts: &Parts) -> Result<String, (StatusCode, String)> {
    if let Some(header) = parts.headers.get(AUTHORIZATION) {
        let value = header.to_str().map_err(|_| {
            (
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header".to_string(),
            )
        })?;
        return value
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .ok_or((
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header format".to_string(),
            ));
    }

    CookieJar::from_headers(&parts.headers)
        .get(STUDENT_TOKEN_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header".to_string(),
        ))
}

fn claims_from_parts(parts: &Parts) -> Result<(Uuid, String), (StatusCode, String)> {
    let token = bearer_or_cookie(parts)?;

    let secret = config_loader::get_auth_secret().map_err(|err| {
        warn!(error = ?err, "auth: jwt secret unavailable");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Authentication is not configured".to_string(),
        )
    })?;

    let claims = validate_jwt(&token, &secret.jwt_secret)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.0.to_string()))?;

    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| {
        (
            StatusCode::UNAUTHORIZED,
            "Invalid user ID in token".to_string(),
        )
    })?;

    Ok((user_id, claims.role))
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthStudent
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let (student_id, role) = claims_from_parts(parts)?;
        if role != STUDENT_ROLE {
            return Err((
                StatusCode::FORBIDDEN,
                "Only students can access this resource".to_string(),
            ));
        }

        Ok(AuthStudent { student_id })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthAdmin
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let (admin_id, role) = claims_from_parts(parts)?;
        if role != ADMIN_ROLE {
            return Err((
                StatusCode::FORBIDDEN,
                "Only admins can access this resource".to_string(),
            ));
        }

        Ok(AuthAdmin { admin_id })
    }
}

#[cfg(test)]
mod tests;
