use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use diesel::{RunQueryDsl, dsl::count_star, insert_into, prelude::*, update};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain;
use crate::infra::db::postgres::{
    postgres_connection::PgPoolSquad,
    schema::{courses, enrolled_courses, instructor_wallets, students},
};
use domain::{
    entities::enrollments::{InsertEnrolledCourseEntity, INSTRUCTOR_POINTS_PER_ENROLLMENT},
    repositories::enrollments::{EnrollmentOutcome, EnrollmentRepository},
};

pub struct EnrollmentPostgres {
    db_pool: Arc<PgPoolSquad>,
}

impl EnrollmentPostgres {
    pub fn new(db_pool: Arc<PgPoolSquad>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl EnrollmentRepository for EnrollmentPostgres {
    async fn enroll_with_credit(
        &self,
        student_id: Uuid,
        course_id: Uuid,
    ) -> Result<EnrollmentOutcome> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let outcome = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let instructor_id = courses::table
                .filter(courses::id.eq(course_id))
                .select(courses::instructor_id)
                .first::<Uuid>(conn)
                .optional()?;
            let Some(instructor_id) = instructor_id else {
                return Ok(EnrollmentOutcome::CourseNotFound);
            };

            let already_enrolled = enrolled_courses::table
                .filter(enrolled_courses::course_id.eq(course_id))
                .filter(enrolled_courses::student_id.eq(student_id))
                .select(count_star())
                .get_result::<i64>(conn)?
                > 0;
            if already_enrolled {
                return Ok(EnrollmentOutcome::AlreadyEnrolled);
            }

            // Decrement-if-positive; bumping the version serializes with credit resets.
            let remaining = update(
                students::table
                    .filter(students::id.eq(student_id))
                    .filter(students::remaining_enrollment_credits.gt(0)),
            )
            .set((
                students::remaining_enrollment_credits
                    .eq(students::remaining_enrollment_credits - 1),
                students::entitlement_version.eq(students::entitlement_version + 1),
                students::updated_at.eq(Utc::now()),
            ))
            .returning(students::remaining_enrollment_credits)
            .get_result::<i32>(conn)
            .optional()?;
            let Some(remaining_enrollment_credits) = remaining else {
                return Ok(EnrollmentOutcome::NoCredits);
            };

            insert_into(enrolled_courses::table)
                .values(&InsertEnrolledCourseEntity {
                    course_id,
                    student_id,
                })
                .execute(conn)?;

            insert_into(instructor_wallets::table)
                .values((
                    instructor_wallets::instructor_id.eq(instructor_id),
                    instructor_wallets::points.eq(INSTRUCTOR_POINTS_PER_ENROLLMENT),
                ))
                .on_conflict(instructor_wallets::instructor_id)
                .do_update()
                .set((
                    instructor_wallets::points
                        .eq(instructor_wallets::points + INSTRUCTOR_POINTS_PER_ENROLLMENT),
                    instructor_wallets::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;

            Ok(EnrollmentOutcome::Enrolled {
                remaining_enrollment_credits,
            })
        })?;

        Ok(outcome)
    }
}
