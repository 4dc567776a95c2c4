use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use diesel::{RunQueryDsl, prelude::*, update};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain;
use crate::infra::db::postgres::{postgres_connection::PgPoolSquad, schema::students};
use domain::{entities::students::StudentEntity, repositories::students::StudentRepository};

pub struct StudentPostgres {
    db_pool: Arc<PgPoolSquad>,
}

impl StudentPostgres {
    pub fn new(db_pool: Arc<PgPoolSquad>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl StudentRepository for StudentPostgres {
    async fn find_by_id(&self, student_id: Uuid) -> Result<Option<StudentEntity>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let student = students::table
            .filter(students::id.eq(student_id))
            .select(StudentEntity::as_select())
            .first::<StudentEntity>(&mut conn)
            .optional()?;

        Ok(student)
    }

    async fn set_customer_id(&self, student_id: Uuid, customer_id: &str) -> Result<()> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        update(students::table.filter(students::id.eq(student_id)))
            .set((
                students::customer_id.eq(customer_id),
                students::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;

        Ok(())
    }
}
