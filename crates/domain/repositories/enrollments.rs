use anyhow::Result;
use async_trait::async_trait;
use mockall::automock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentOutcome {
    Enrolled { remaining_enrollment_credits: i32 },
    CourseNotFound,
    AlreadyEnrolled,
    NoCredits,
}

#[automock]
#[async_trait]
pub trait EnrollmentRepository {
    /// Spends one credit, records the enrollment and pays the instructor, all or nothing.
    async fn enroll_with_credit(
        &self,
        student_id: Uuid,
        course_id: Uuid,
    ) -> Result<EnrollmentOutcome>;
}
