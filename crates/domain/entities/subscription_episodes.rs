use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::{
    domain::value_objects::enums::episode_statuses::EpisodeStatus,
    infra::db::postgres::schema::subscription_episodes,
};

/// One billing attempt (subscribe, resubscribe or plan change). Rows are never deleted.
#[derive(Debug, Clone, Identifiable, Selectable, Queryable, PartialEq)]
#[diesel(table_name = subscription_episodes)]
pub struct SubscriptionEpisodeEntity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub remote_customer_id: String,
    pub remote_subscription_id: Option<String>,
    pub price_id: String,
    pub status: String,
    pub billing_cycle_anchor: Option<DateTime<Utc>>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub remote_observed_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionEpisodeEntity {
    pub fn episode_status(&self) -> Option<EpisodeStatus> {
        EpisodeStatus::from_str(&self.status)
    }

    pub fn is_live(&self) -> bool {
        self.episode_status().is_some_and(|status| status.is_live())
    }

    /// State of this row after `update` commits.
    pub fn with_update(&self, update: &EpisodeUpdate) -> Self {
        Self {
            status: update.status.to_string(),
            remote_subscription_id: update.remote_subscription_id.clone(),
            billing_cycle_anchor: update.billing_cycle_anchor,
            current_period_start: update.current_period_start,
            current_period_end: update.current_period_end,
            trial_ends_at: update.trial_ends_at,
            ended_at: update.ended_at,
            remote_observed_at: update.remote_observed_at,
            version: update.expected_version + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Insertable, PartialEq)]
#[diesel(table_name = subscription_episodes)]
pub struct InsertSubscriptionEpisodeEntity {
    pub user_id: Uuid,
    pub remote_customer_id: String,
    pub remote_subscription_id: Option<String>,
    pub price_id: String,
    pub status: String,
}

impl InsertSubscriptionEpisodeEntity {
    pub fn pending(user_id: Uuid, remote_customer_id: &str, price_id: &str) -> Self {
        Self {
            user_id,
            remote_customer_id: remote_customer_id.to_string(),
            remote_subscription_id: None,
            price_id: price_id.to_string(),
            status: EpisodeStatus::Pending.to_string(),
        }
    }
}

/// Full replacement of the remote-mirrored columns, applied only while the row
/// still carries `expected_version`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeUpdate {
    pub episode_id: Uuid,
    pub expected_version: i64,
    pub status: EpisodeStatus,
    pub remote_subscription_id: Option<String>,
    pub billing_cycle_anchor: Option<DateTime<Utc>>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub remote_observed_at: Option<DateTime<Utc>>,
}

impl EpisodeUpdate {
    /// Status change decided locally (not observed remotely). Keeps the remote
    /// recency marker so a later webhook can still correct the row.
    pub fn local_status_change(episode: &SubscriptionEpisodeEntity, status: EpisodeStatus) -> Self {
        Self {
            episode_id: episode.id,
            expected_version: episode.version,
            status,
            remote_subscription_id: episode.remote_subscription_id.clone(),
            billing_cycle_anchor: episode.billing_cycle_anchor,
            current_period_start: episode.current_period_start,
            current_period_end: episode.current_period_end,
            trial_ends_at: episode.trial_ends_at,
            ended_at: episode.ended_at,
            remote_observed_at: episode.remote_observed_at,
        }
    }
}
