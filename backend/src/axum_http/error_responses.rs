use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::usecases::{
    billing_gateway::BillingError, enrollments::EnrollmentError,
    stripe_webhook::WebhookError, subscriptions::SubscriptionError,
};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub data: T,
}

/// Request-boundary error. Every use-case error is rendered through this.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }

    fn from_status(status: StatusCode, message: String) -> Self {
        // Server-side failures never carry internal detail to the client.
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            return Self::internal();
        }
        Self::new(status, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            success: false,
            code: self.status.as_u16(),
            message: self.message,
        });

        (self.status, body).into_response()
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(err: SubscriptionError) -> Self {
        Self::from_status(err.status_code(), err.to_string())
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        Self::from_status(err.status_code(), err.to_string())
    }
}

impl From<EnrollmentError> for ApiError {
    fn from(err: EnrollmentError) -> Self {
        Self::from_status(err.status_code(), err.to_string())
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        Self::from_status(err.status_code(), err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = ?err, "http: unhandled internal error");
        Self::internal()
    }
}

pub fn success<T: Serialize>(message: &str, data: T) -> Response {
    let body = Json(SuccessResponse {
        success: true,
        message: message.to_string(),
        data,
    });

    (StatusCode::OK, body).into_response()
}

/// Renders a use-case result as the success or error envelope.
pub fn respond<T, E>(message: &str, result: Result<T, E>) -> Response
where
    T: Serialize,
    E: Into<ApiError>,
{
    match result {
        Ok(data) => success(message, data),
        Err(err) => err.into().into_response(),
    }
}
