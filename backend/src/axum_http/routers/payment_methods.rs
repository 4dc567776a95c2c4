use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::Response,
    routing::{delete, get, put},
};
use lms::{
    domain::{
        repositories::students::StudentRepository,
        value_objects::billing::{AddPaymentMethodModel, PaymentMethodModel},
    },
    infra::db::{
        postgres::postgres_connection::PgPoolSquad, repositories::students::StudentPostgres,
    },
    payments::stripe_client::StripeClient,
};
use serde::Deserialize;

use crate::{
    auth::AuthStudent,
    axum_http::{detached::run_detached, error_responses::respond},
    usecases::{billing_gateway::BillingGateway, payment_methods::PaymentMethodUseCase},
};

#[derive(Debug, Default, Deserialize)]
pub struct ListPaymentMethodsQuery {
    #[serde(default)]
    pub details: bool,
}

pub fn routes(db_pool: Arc<PgPoolSquad>, gateway: Arc<StripeClient>) -> Router {
    let student_repository = StudentPostgres::new(Arc::clone(&db_pool));
    let payment_methods_usecase = PaymentMethodUseCase::new(Arc::new(student_repository), gateway);

    Router::new()
        .route("/", get(list).post(add))
        .route("/default", put(set_default))
        .route("/:payment_method_id", delete(detach))
        .with_state(Arc::new(payment_methods_usecase))
}

pub async fn list<St, G>(
    State(payment_methods_usecase): State<Arc<PaymentMethodUseCase<St, G>>>,
    auth: AuthStudent,
    Query(query): Query<ListPaymentMethodsQuery>,
) -> Response
where
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    respond(
        "Payment methods retrieved",
        payment_methods_usecase
            .list(auth.student_id, query.details)
            .await,
    )
}

pub async fn add<St, G>(
    State(payment_methods_usecase): State<Arc<PaymentMethodUseCase<St, G>>>,
    auth: AuthStudent,
    Json(add_payment_method_model): Json<AddPaymentMethodModel>,
) -> Response
where
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    let result = run_detached("add_payment_method", async move {
        payment_methods_usecase
            .add(auth.student_id, add_payment_method_model)
            .await
    })
    .await;

    respond("Payment method added", result)
}

pub async fn detach<St, G>(
    State(payment_methods_usecase): State<Arc<PaymentMethodUseCase<St, G>>>,
    auth: AuthStudent,
    Path(payment_method_id): Path<String>,
) -> Response
where
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    let result = run_detached("detach_payment_method", async move {
        payment_methods_usecase
            .detach(auth.student_id, PaymentMethodModel { payment_method_id })
            .await
    })
    .await;

    respond("Payment method removed", result)
}

pub async fn set_default<St, G>(
    State(payment_methods_usecase): State<Arc<PaymentMethodUseCase<St, G>>>,
    auth: AuthStudent,
    Json(payment_method_model): Json<PaymentMethodModel>,
) -> Response
where
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    let result = run_detached("set_default_payment_method", async move {
        payment_methods_usecase
            .set_default(auth.student_id, payment_method_model)
            .await
    })
    .await;

    respond("Default payment method updated", result)
}
