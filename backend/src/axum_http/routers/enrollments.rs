use std::sync::Arc;

use axum::{Json, Router, extract::State, response::Response, routing::post};
use lms::{
    domain::{
        repositories::{
            enrollments::EnrollmentRepository, students::StudentRepository,
            subscription_episodes::SubscriptionLedgerRepository,
        },
        value_objects::enrollments::EnrollModel,
    },
    infra::db::{
        postgres::postgres_connection::PgPoolSquad,
        repositories::{
            enrollments::EnrollmentPostgres, students::StudentPostgres,
            subscription_episodes::SubscriptionLedgerPostgres,
        },
    },
};

use crate::{
    auth::AuthStudent,
    axum_http::{detached::run_detached, error_responses::respond},
    usecases::enrollments::EnrollmentUseCase,
};

pub fn routes(db_pool: Arc<PgPoolSquad>) -> Router {
    let ledger_repository = SubscriptionLedgerPostgres::new(Arc::clone(&db_pool));
    let student_repository = StudentPostgres::new(Arc::clone(&db_pool));
    let enrollment_repository = EnrollmentPostgres::new(Arc::clone(&db_pool));
    let enrollments_usecase = EnrollmentUseCase::new(
        Arc::new(ledger_repository),
        Arc::new(student_repository),
        Arc::new(enrollment_repository),
    );

    Router::new()
        .route("/enroll", post(enroll))
        .with_state(Arc::new(enrollments_usecase))
}

pub async fn enroll<L, St, E>(
    State(enrollments_usecase): State<Arc<EnrollmentUseCase<L, St, E>>>,
    auth: AuthStudent,
    Json(enroll_model): Json<EnrollModel>,
) -> Response
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    E: EnrollmentRepository + Send + Sync + 'static,
{
    let result = run_detached("enroll", async move {
        enrollments_usecase.enroll(auth.student_id, enroll_model).await
    })
    .await;

    respond("Enrolled successfully", result)
}
