pub mod admin_dashboard;
pub mod enrollments;
pub mod invoices;
pub mod payment_methods;
pub mod stripe_webhook;
pub mod subscriptions;

use std::sync::Arc;

use lms::{
    domain::value_objects::plans::PlanCatalog,
    infra::db::{
        postgres::postgres_connection::PgPoolSquad,
        repositories::{
            students::StudentPostgres, subscription_episodes::SubscriptionLedgerPostgres,
        },
    },
};

use crate::usecases::entitlement_reconciler::EntitlementReconciler;

pub type PostgresReconciler = EntitlementReconciler<SubscriptionLedgerPostgres, StudentPostgres>;

/// Ledger and student repositories plus the reconciler that writes through them.
pub fn ledger_stack(
    db_pool: &Arc<PgPoolSquad>,
    catalog: &Arc<PlanCatalog>,
) -> (
    Arc<SubscriptionLedgerPostgres>,
    Arc<StudentPostgres>,
    Arc<PostgresReconciler>,
) {
    let ledger_repository = Arc::new(SubscriptionLedgerPostgres::new(Arc::clone(db_pool)));
    let student_repository = Arc::new(StudentPostgres::new(Arc::clone(db_pool)));
    let reconciler = Arc::new(EntitlementReconciler::new(
        Arc::clone(&ledger_repository),
        Arc::clone(&student_repository),
        Arc::clone(catalog),
    ));

    (ledger_repository, student_repository, reconciler)
}
