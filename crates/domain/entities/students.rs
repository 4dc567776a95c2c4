use diesel::prelude::*;
use uuid::Uuid;

use crate::{
    domain::value_objects::entitlements::{Entitlement, EntitlementUpdate},
    infra::db::postgres::schema::students,
};

/// Student row. The last three columns form the entitlement owned by the reconciler.
#[derive(Debug, Clone, Identifiable, Selectable, Queryable, PartialEq)]
#[diesel(table_name = students)]
pub struct StudentEntity {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub customer_id: Option<String>,
    pub active_episode_id: Option<Uuid>,
    pub remaining_enrollment_credits: i32,
    pub entitlement_version: i64,
}

impl StudentEntity {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    pub fn entitlement(&self) -> Entitlement {
        Entitlement {
            active_episode_id: self.active_episode_id,
            remaining_enrollment_credits: self.remaining_enrollment_credits,
        }
    }

    /// State of this row after `update` commits.
    pub fn with_entitlement(&self, update: &EntitlementUpdate) -> Self {
        Self {
            active_episode_id: update.active_episode_id,
            remaining_enrollment_credits: update.remaining_enrollment_credits,
            entitlement_version: update.expected_version + 1,
            ..self.clone()
        }
    }
}
