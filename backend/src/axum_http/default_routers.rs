use axum::{http::StatusCode, response::IntoResponse};
use tracing::info;

use crate::axum_http::error_responses::ApiError;

pub async fn not_found() -> impl IntoResponse {
    info!("backend router: not_found handler invoked");
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND")
}

pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK").into_response()
}
