use super::*;
use axum::http::Request;
use jsonwebtoken::{EncodingKey, Header, encode};
use std::env;

const SECRET: &str = "supersecretjwtsecretforunittesting123";
const STUDENT_ID: &str = "123e4567-e89b-12d3-a456-426614174000";

fn set_env_vars() {
    unsafe {
        env::set_var("JWT_SECRET", SECRET);
    }
}

fn token(role: &str, exp: usize, secret: &str) -> String {
    let claims = Claims {
        sub: STUDENT_ID.to_string(),
        role: role.to_string(),
        exp,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

fn parts_with(header: (&str, String)) -> Parts {
    let (parts, _) = Request::builder()
        .header(header.0, header.1)
        .body(())
        .unwrap()
        .into_parts();
    parts
}

#[test]
fn test_validate_jwt_success() {
    let claims = validate_jwt(&token(STUDENT_ROLE, 9999999999, SECRET), SECRET)
        .expect("Valid token should pass");

    assert_eq!(claims.sub, STUDENT_ID);
    assert_eq!(claims.role, STUDENT_ROLE);
}

#[test]
fn test_validate_jwt_expired() {
    let result = validate_jwt(&token(STUDENT_ROLE, 1, SECRET), SECRET);
    assert!(result.is_err());
}

#[test]
fn test_validate_jwt_invalid_signature() {
    let result = validate_jwt(&token(STUDENT_ROLE, 9999999999, "wrongsecret"), SECRET);
    assert!(result.is_err());
}

#[tokio::test]
async fn test_student_from_bearer_header() {
    set_env_vars();
    let mut parts = parts_with((
        "authorization",
        format!("Bearer {}", token(STUDENT_ROLE, 9999999999, SECRET)),
    ));

    let student = AuthStudent::from_request_parts(&mut parts, &()).await.unwrap();

    assert_eq!(student.student_id, Uuid::parse_str(STUDENT_ID).unwrap());
}

#[tokio::test]
async fn test_student_from_cookie() {
    set_env_vars();
    let mut parts = parts_with((
        "cookie",
        format!(
            "{STUDENT_TOKEN_COOKIE}={}",
            token(STUDENT_ROLE, 9999999999, SECRET)
        ),
    ));

    let student = AuthStudent::from_request_parts(&mut parts, &()).await.unwrap();

    assert_eq!(student.student_id, Uuid::parse_str(STUDENT_ID).unwrap());
}

#[tokio::test]
async fn test_admin_route_rejects_student_token() {
    set_env_vars();
    let mut parts = parts_with((
        "authorization",
        format!("Bearer {}", token(STUDENT_ROLE, 9999999999, SECRET)),
    ));

    let rejection = AuthAdmin::from_request_parts(&mut parts, &())
        .await
        .unwrap_err();

    assert_eq!(rejection.0, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_missing_credentials_are_unauthorized() {
    set_env_vars();
    let mut parts = parts_with(("x-request-id", "abc".to_string()));

    let rejection = AuthStudent::from_request_parts(&mut parts, &())
        .await
        .unwrap_err();

    assert_eq!(rejection.0, StatusCode::UNAUTHORIZED);
}
