use anyhow::Result;
use async_trait::async_trait;
use mockall::automock;
use uuid::Uuid;

use crate::domain::entities::students::StudentEntity;

#[automock]
#[async_trait]
pub trait StudentRepository {
    async fn find_by_id(&self, student_id: Uuid) -> Result<Option<StudentEntity>>;

    async fn set_customer_id(&self, student_id: Uuid, customer_id: &str) -> Result<()>;
}
