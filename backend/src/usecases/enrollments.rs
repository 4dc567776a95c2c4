use std::sync::Arc;

use axum::http::StatusCode;
use lms::domain::{
    repositories::{
        enrollments::{EnrollmentOutcome, EnrollmentRepository},
        students::StudentRepository,
        subscription_episodes::SubscriptionLedgerRepository,
    },
    value_objects::enrollments::{EnrollModel, EnrollmentDto},
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("student not found")]
    StudentNotFound,
    #[error("An active subscription is required")]
    NotSubscriber,
    #[error("Course not found")]
    CourseNotFound,
    #[error("Already enrolled in this course")]
    AlreadyEnrolled,
    #[error("Enrollment limit reached for the current plan")]
    CapacityExceeded,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EnrollmentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EnrollmentError::StudentNotFound | EnrollmentError::CourseNotFound => {
                StatusCode::NOT_FOUND
            }
            EnrollmentError::NotSubscriber => StatusCode::UNAUTHORIZED,
            EnrollmentError::AlreadyEnrolled => StatusCode::CONFLICT,
            EnrollmentError::CapacityExceeded => StatusCode::FORBIDDEN,
            EnrollmentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub struct EnrollmentUseCase<L, St, E>
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    E: EnrollmentRepository + Send + Sync + 'static,
{
    ledger_repo: Arc<L>,
    student_repo: Arc<St>,
    enrollment_repo: Arc<E>,
}

impl<L, St, E> EnrollmentUseCase<L, St, E>
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
    E: EnrollmentRepository + Send + Sync + 'static,
{
    pub fn new(ledger_repo: Arc<L>, student_repo: Arc<St>, enrollment_repo: Arc<E>) -> Self {
        Self {
            ledger_repo,
            student_repo,
            enrollment_repo,
        }
    }

    /// Subscriber gate: the episode the entitlement points at must be `active`
    /// or `past_due`.
    pub async fn ensure_subscriber(&self, student_id: Uuid) -> Result<(), EnrollmentError> {
        let student = self
            .student_repo
            .find_by_id(student_id)
            .await
            .map_err(|err| {
                error!(%student_id, db_error = ?err, "enrollments: failed to load student");
                EnrollmentError::Internal(err)
            })?
            .ok_or(EnrollmentError::StudentNotFound)?;

        let Some(episode_id) = student.active_episode_id else {
            warn!(
                %student_id,
                status = StatusCode::UNAUTHORIZED.as_u16(),
                "enrollments: student has no active subscription"
            );
            return Err(EnrollmentError::NotSubscriber);
        };

        let episode = self.ledger_repo.find_by_id(episode_id).await.map_err(|err| {
            error!(%student_id, %episode_id, db_error = ?err, "enrollments: failed to load episode");
            EnrollmentError::Internal(err)
        })?;
        let grants_access = episode
            .and_then(|episode| episode.episode_status())
            .is_some_and(|status| status.grants_access());
        if !grants_access {
            warn!(
                %student_id,
                %episode_id,
                status = StatusCode::UNAUTHORIZED.as_u16(),
                "enrollments: subscription does not grant access"
            );
            return Err(EnrollmentError::NotSubscriber);
        }

        Ok(())
    }

    pub async fn enroll(&self, student_id: Uuid, enroll_model: EnrollModel) -> Result<EnrollmentDto, EnrollmentError> {
        self.ensure_subscriber(student_id).await?;
        let course_id = enroll_model.course_id;

        let outcome = self
            .enrollment_repo
            .enroll_with_credit(student_id, course_id)
            .await
            .map_err(|err| {
                error!(%student_id, %course_id, db_error = ?err, "enrollments: enroll failed");
                EnrollmentError::Internal(err)
            })?;

        match outcome {
            EnrollmentOutcome::Enrolled {
                remaining_enrollment_credits,
            } => {
                info!(
                    %student_id,
                    %course_id,
                    remaining_enrollment_credits,
                    "enrollments: student enrolled"
                );
                Ok(EnrollmentDto {
                    course_id,
                    remaining_enrollment_credits,
                })
            }
            EnrollmentOutcome::CourseNotFound => Err(EnrollmentError::CourseNotFound),
            EnrollmentOutcome::AlreadyEnrolled => Err(EnrollmentError::AlreadyEnrolled),
            EnrollmentOutcome::NoCredits => {
                warn!(
                    %student_id,
                    %course_id,
                    status = StatusCode::FORBIDDEN.as_u16(),
                    "enrollments: no enrollment credits left"
                );
                Err(EnrollmentError::CapacityExceeded)
            }
        }
    }
}
