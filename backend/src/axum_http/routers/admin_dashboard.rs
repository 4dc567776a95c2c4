use std::sync::Arc;

use axum::{Router, extract::State, response::Response, routing::get};
use lms::{
    domain::{
        repositories::subscription_episodes::SubscriptionLedgerRepository,
        value_objects::plans::PlanCatalog,
    },
    infra::db::{
        postgres::postgres_connection::PgPoolSquad,
        repositories::subscription_episodes::SubscriptionLedgerPostgres,
    },
};
use tracing::info;

use crate::{
    auth::AuthAdmin,
    axum_http::error_responses::{ApiError, respond},
    usecases::plans_overview::PlansOverviewUseCase,
};

pub fn routes(db_pool: Arc<PgPoolSquad>, catalog: Arc<PlanCatalog>) -> Router {
    let ledger_repository = SubscriptionLedgerPostgres::new(Arc::clone(&db_pool));
    let plans_overview_usecase = PlansOverviewUseCase::new(Arc::new(ledger_repository), catalog);

    Router::new()
        .route("/plans-overview", get(plans_overview))
        .with_state(Arc::new(plans_overview_usecase))
}

pub async fn plans_overview<L>(
    State(plans_overview_usecase): State<Arc<PlansOverviewUseCase<L>>>,
    auth: AuthAdmin,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
{
    info!(admin_id = %auth.admin_id, "admin_dashboard: plans overview requested");
    respond(
        "Plans overview retrieved",
        plans_overview_usecase
            .overview()
            .await
            .map_err(ApiError::from),
    )
}
