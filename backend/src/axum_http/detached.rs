use std::future::Future;

use tracing::error;

use crate::axum_http::error_responses::ApiError;

/// Runs a mutating flow on its own task so a client disconnect cannot cancel
/// a billing-provider call that was already sent.
pub async fn run_detached<F, T, E>(label: &'static str, flow: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    match tokio::spawn(flow).await {
        Ok(result) => result.map_err(Into::into),
        Err(join_error) => {
            error!(
                flow = label,
                error = %join_error,
                "http: detached flow aborted"
            );
            Err(ApiError::internal())
        }
    }
}
