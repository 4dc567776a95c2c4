use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    entities::subscription_episodes::SubscriptionEpisodeEntity,
    value_objects::{
        entitlements::Entitlement,
        plans::{PlanCatalog, PlanDetailsDto},
    },
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeModel {
    pub plan: String,
    pub payment_method_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResubscribeModel {
    pub plan: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanModel {
    pub new_plan: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeDto {
    pub episode_id: Uuid,
    pub status: String,
    pub plan: Option<PlanDetailsDto>,
    pub price_id: String,
    pub remote_customer_id: String,
    pub remote_subscription_id: Option<String>,
    pub billing_cycle_anchor: Option<DateTime<Utc>>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EpisodeDto {
    pub fn from_entity(episode: &SubscriptionEpisodeEntity, catalog: &PlanCatalog) -> Self {
        Self {
            episode_id: episode.id,
            status: episode.status.clone(),
            plan: catalog.by_price(&episode.price_id).map(|entry| entry.details()),
            price_id: episode.price_id.clone(),
            remote_customer_id: episode.remote_customer_id.clone(),
            remote_subscription_id: episode.remote_subscription_id.clone(),
            billing_cycle_anchor: episode.billing_cycle_anchor,
            current_period_start: episode.current_period_start,
            current_period_end: episode.current_period_end,
            trial_ends_at: episode.trial_ends_at,
            ended_at: episode.ended_at,
            created_at: episode.created_at,
            updated_at: episode.updated_at,
        }
    }
}

/// What the student currently holds: the active episode (if any) and the credits left on it.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStateDto {
    pub subscription: Option<EpisodeDto>,
    pub remaining_enrollment_credits: i32,
}

impl SubscriptionStateDto {
    pub fn new(episode: Option<EpisodeDto>, entitlement: Entitlement) -> Self {
        Self {
            subscription: episode,
            remaining_enrollment_credits: entitlement.remaining_enrollment_credits,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlanCountDto {
    pub name: String,
    pub value: i64,
}
