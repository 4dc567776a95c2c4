use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use lms::{
    domain::{
        repositories::{
            students::StudentRepository, subscription_episodes::SubscriptionLedgerRepository,
        },
        value_objects::plans::PlanCatalog,
    },
    infra::db::postgres::postgres_connection::PgPoolSquad,
    payments::stripe_client::StripeClient,
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    axum_http::{error_responses::ApiError, routers::ledger_stack},
    usecases::{
        billing_gateway::BillingGateway,
        stripe_webhook::{StripeWebhookUseCase, WebhookReceipt},
    },
};

pub const STRIPE_SIGNATURE_HEADER: &str = "Stripe-Signature";

pub fn routes(
    db_pool: Arc<PgPoolSquad>,
    gateway: Arc<StripeClient>,
    catalog: Arc<PlanCatalog>,
) -> Router {
    let (ledger_repository, _, reconciler) = ledger_stack(&db_pool, &catalog);
    let webhook_usecase = StripeWebhookUseCase::new(ledger_repository, gateway, reconciler);

    Router::new()
        .route("/", post(stripe_webhook))
        .with_state(Arc::new(webhook_usecase))
}

/// Raw body is required: the signature covers the exact bytes Stripe sent.
pub async fn stripe_webhook<L, St, G>(
    State(webhook_usecase): State<Arc<StripeWebhookUseCase<L, St, G>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    let Some(signature) = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        warn!("stripe_webhook: request without signature header");
        return ApiError::new(StatusCode::BAD_REQUEST, "Missing Stripe-Signature header")
            .into_response();
    };

    let event = match webhook_usecase.verify(&body, signature) {
        Ok(Some(event)) => event,
        Ok(None) => return received(),
        Err(err) => return ApiError::from(err).into_response(),
    };

    // Ingestion runs detached so a dropped connection cannot interrupt a ledger write.
    let ingestion = tokio::spawn(async move { webhook_usecase.ingest(event).await }).await;
    match ingestion {
        Ok(Ok(WebhookReceipt::Applied { episode_id })) => {
            info!(%episode_id, "stripe_webhook: acknowledged applied event");
        }
        Ok(Ok(receipt)) => {
            info!(receipt = ?receipt, "stripe_webhook: acknowledged without changes");
        }
        Ok(Err(err)) => return ApiError::from(err).into_response(),
        Err(join_error) => {
            error!(error = %join_error, "stripe_webhook: ingestion task aborted");
            return ApiError::internal().into_response();
        }
    }

    received()
}

fn received() -> Response {
    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}
