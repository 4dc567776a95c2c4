use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::Response,
    routing::{get, post},
};
use lms::{
    domain::{
        repositories::{
            students::StudentRepository, subscription_episodes::SubscriptionLedgerRepository,
        },
        value_objects::{
            billing::{InvoiceListQuery, PayInvoiceModel},
            plans::PlanCatalog,
        },
    },
    infra::db::postgres::postgres_connection::PgPoolSquad,
    payments::stripe_client::StripeClient,
};

use crate::{
    auth::AuthStudent,
    axum_http::{detached::run_detached, error_responses::respond, routers::ledger_stack},
    usecases::{billing_gateway::BillingGateway, invoices::InvoiceUseCase},
};

pub fn routes(
    db_pool: Arc<PgPoolSquad>,
    gateway: Arc<StripeClient>,
    catalog: Arc<PlanCatalog>,
) -> Router {
    let (ledger_repository, student_repository, reconciler) = ledger_stack(&db_pool, &catalog);
    let invoices_usecase = InvoiceUseCase::new(
        ledger_repository,
        student_repository,
        gateway,
        reconciler,
        catalog,
    );

    Router::new()
        .route("/", get(list))
        .route("/stats", get(stats))
        .route("/pay", post(pay))
        .route("/:invoice_id", get(get_invoice))
        .with_state(Arc::new(invoices_usecase))
}

pub async fn list<L, St, G>(
    State(invoices_usecase): State<Arc<InvoiceUseCase<L, St, G>>>,
    auth: AuthStudent,
    Query(query): Query<InvoiceListQuery>,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    respond(
        "Invoices retrieved!",
        invoices_usecase.list(auth.student_id, query).await,
    )
}

pub async fn get_invoice<L, St, G>(
    State(invoices_usecase): State<Arc<InvoiceUseCase<L, St, G>>>,
    auth: AuthStudent,
    Path(invoice_id): Path<String>,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    respond(
        "Invoice retrieved successfully",
        invoices_usecase.get(auth.student_id, &invoice_id).await,
    )
}

pub async fn pay<L, St, G>(
    State(invoices_usecase): State<Arc<InvoiceUseCase<L, St, G>>>,
    auth: AuthStudent,
    Json(pay_invoice_model): Json<PayInvoiceModel>,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    let result = run_detached("pay_invoice", async move {
        invoices_usecase
            .pay(auth.student_id, pay_invoice_model)
            .await
    })
    .await;

    respond("Invoice paid!", result)
}

pub async fn stats<L, St, G>(
    State(invoices_usecase): State<Arc<InvoiceUseCase<L, St, G>>>,
    auth: AuthStudent,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    G: BillingGateway + Send + Sync + 'static,
{
    respond(
        "Invoice stats retrieved",
        invoices_usecase.stats(auth.student_id).await,
    )
}
