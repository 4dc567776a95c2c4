use diesel::prelude::*;
use uuid::Uuid;

use crate::infra::db::postgres::schema::enrolled_courses;

/// Points credited to the course instructor for every paid enrollment.
pub const INSTRUCTOR_POINTS_PER_ENROLLMENT: i32 = 10;

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = enrolled_courses)]
pub struct InsertEnrolledCourseEntity {
    pub course_id: Uuid,
    pub student_id: Uuid,
}
