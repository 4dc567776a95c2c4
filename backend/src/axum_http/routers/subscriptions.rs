use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::Response,
    routing::{get, post, put},
};
use chrono::Duration;
use lms::{
    domain::{
        repositories::{
            students::StudentRepository, subscription_episodes::SubscriptionLedgerRepository,
        },
        value_objects::{
            plans::PlanCatalog,
            subscriptions::{ChangePlanModel, ResubscribeModel, SubscribeModel},
        },
    },
    infra::db::postgres::postgres_connection::PgPoolSquad,
    payments::stripe_client::StripeClient,
};

use crate::{
    auth::AuthStudent,
    axum_http::{detached::run_detached, error_responses::respond, routers::ledger_stack},
    usecases::{billing_gateway::BillingGateway, subscriptions::SubscriptionUseCase},
};

pub fn routes(
    db_pool: Arc<PgPoolSquad>,
    gateway: Arc<StripeClient>,
    catalog: Arc<PlanCatalog>,
    pending_episode_grace: Duration,
) -> Router {
    let (ledger_repository, student_repository, reconciler) = ledger_stack(&db_pool, &catalog);
    let subscriptions_usecase = SubscriptionUseCase::new(
        ledger_repository,
        student_repository,
        gateway,
        reconciler,
        catalog,
        pending_episode_grace,
    );

    Router::new()
        .route("/subscribe", post(subscribe))
        .route("/resubscribe", post(resubscribe))
        .route("/plan", put(change_plan))
        .route("/cancel", post(cancel))
        .route("/subscription", get(current_subscription))
        .with_state(Arc::new(subscriptions_usecase))
}

pub async fn subscribe<L, St, G>(
    State(subscriptions_usecase): State<Arc<SubscriptionUseCase<L, St, G>>>,
    auth: AuthStudent,
    Json(subscribe_model): Json<SubscribeModel>,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    let result = run_detached("subscribe", async move {
        subscriptions_usecase
            .subscribe(auth.student_id, subscribe_model)
            .await
    })
    .await;

    respond("Subscription created successfully", result)
}

pub async fn resubscribe<L, St, G>(
    State(subscriptions_usecase): State<Arc<SubscriptionUseCase<L, St, G>>>,
    auth: AuthStudent,
    Json(resubscribe_model): Json<ResubscribeModel>,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    let result = run_detached("resubscribe", async move {
        subscriptions_usecase
            .resubscribe(auth.student_id, resubscribe_model)
            .await
    })
    .await;

    respond("Resubscribed successfully", result)
}

pub async fn change_plan<L, St, G>(
    State(subscriptions_usecase): State<Arc<SubscriptionUseCase<L, St, G>>>,
    auth: AuthStudent,
    Json(change_plan_model): Json<ChangePlanModel>,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    let result = run_detached("change_plan", async move {
        subscriptions_usecase
            .change_plan(auth.student_id, change_plan_model)
            .await
    })
    .await;

    respond("Plan updated successfully", result)
}

pub async fn cancel<L, St, G>(
    State(subscriptions_usecase): State<Arc<SubscriptionUseCase<L, St, G>>>,
    auth: AuthStudent,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    let result = run_detached("cancel", async move {
        subscriptions_usecase.cancel(auth.student_id).await
    })
    .await;

    respond("Subscription canceled successfully", result)
}

pub async fn current_subscription<L, St, G>(
    State(subscriptions_usecase): State<Arc<SubscriptionUseCase<L, St, G>>>,
    auth: AuthStudent,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    respond(
        "Subscription retrieved",
        subscriptions_usecase
            .current_subscription(auth.student_id)
            .await,
    )
}
