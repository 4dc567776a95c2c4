use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::{RunQueryDsl, dsl::count_star, insert_into, prelude::*, update};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain;
use crate::infra::db::postgres::{
    postgres_connection::PgPoolSquad,
    schema::{students, subscription_episodes},
};
use domain::{
    entities::subscription_episodes::{
        EpisodeUpdate, InsertSubscriptionEpisodeEntity, SubscriptionEpisodeEntity,
    },
    repositories::subscription_episodes::{EpisodeCreation, SubscriptionLedgerRepository},
    value_objects::{entitlements::EntitlementUpdate, enums::episode_statuses::EpisodeStatus},
};

pub struct SubscriptionLedgerPostgres {
    db_pool: Arc<PgPoolSquad>,
}

impl SubscriptionLedgerPostgres {
    pub fn new(db_pool: Arc<PgPoolSquad>) -> Self {
        Self { db_pool }
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = subscription_episodes, treat_none_as_null = true)]
struct EpisodeChangeset<'a> {
    status: &'static str,
    remote_subscription_id: Option<&'a str>,
    billing_cycle_anchor: Option<DateTime<Utc>>,
    current_period_start: Option<DateTime<Utc>>,
    current_period_end: Option<DateTime<Utc>>,
    trial_ends_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    remote_observed_at: Option<DateTime<Utc>>,
}

impl<'a> From<&'a EpisodeUpdate> for EpisodeChangeset<'a> {
    fn from(value: &'a EpisodeUpdate) -> Self {
        Self {
            status: value.status.as_str(),
            remote_subscription_id: value.remote_subscription_id.as_deref(),
            billing_cycle_anchor: value.billing_cycle_anchor,
            current_period_start: value.current_period_start,
            current_period_end: value.current_period_end,
            trial_ends_at: value.trial_ends_at,
            ended_at: value.ended_at,
            remote_observed_at: value.remote_observed_at,
        }
    }
}

fn write_episode(conn: &mut PgConnection, episode: &EpisodeUpdate) -> QueryResult<usize> {
    update(
        subscription_episodes::table
            .filter(subscription_episodes::id.eq(episode.episode_id))
            .filter(subscription_episodes::version.eq(episode.expected_version)),
    )
    .set((
        EpisodeChangeset::from(episode),
        subscription_episodes::version.eq(subscription_episodes::version + 1),
        subscription_episodes::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
}

fn supersede_live_episode(conn: &mut PgConnection, episode_id: Uuid) -> QueryResult<usize> {
    let now = Utc::now();
    update(
        subscription_episodes::table
            .filter(subscription_episodes::id.eq(episode_id))
            .filter(subscription_episodes::status.eq_any(EpisodeStatus::live_values())),
    )
    .set((
        subscription_episodes::status.eq(EpisodeStatus::UpdatedToOtherPlan.as_str()),
        subscription_episodes::remote_observed_at.eq(now),
        subscription_episodes::version.eq(subscription_episodes::version + 1),
        subscription_episodes::updated_at.eq(now),
    ))
    .execute(conn)
}

#[async_trait]
impl SubscriptionLedgerRepository for SubscriptionLedgerPostgres {
    async fn create_episode(
        &self,
        insert_episode: InsertSubscriptionEpisodeEntity,
        superseding: Option<Uuid>,
    ) -> Result<EpisodeCreation> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let creation = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            // Row lock on the student serializes concurrent attempts for the same user.
            students::table
                .filter(students::id.eq(insert_episode.user_id))
                .select(students::id)
                .for_update()
                .get_result::<Uuid>(conn)?;

            let mut live = subscription_episodes::table
                .filter(subscription_episodes::user_id.eq(insert_episode.user_id))
                .filter(subscription_episodes::status.eq_any(EpisodeStatus::live_values()))
                .into_boxed();
            if let Some(superseded_id) = superseding {
                live = live.filter(subscription_episodes::id.ne(superseded_id));
            }

            let existing = live
                .order(subscription_episodes::created_at.desc())
                .select(SubscriptionEpisodeEntity::as_select())
                .first::<SubscriptionEpisodeEntity>(conn)
                .optional()?;
            if let Some(existing) = existing {
                return Ok(EpisodeCreation::LiveEpisodeExists(existing));
            }

            let created = insert_into(subscription_episodes::table)
                .values(&insert_episode)
                .returning(SubscriptionEpisodeEntity::as_returning())
                .get_result::<SubscriptionEpisodeEntity>(conn)?;

            Ok(EpisodeCreation::Created(created))
        })?;

        Ok(creation)
    }

    async fn update_episode(&self, episode: EpisodeUpdate) -> Result<bool> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let updated = write_episode(&mut conn, &episode)?;
        Ok(updated == 1)
    }

    async fn mark_superseded(&self, episode_id: Uuid) -> Result<()> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        supersede_live_episode(&mut conn, episode_id)?;
        Ok(())
    }

    async fn find_live_episode(&self, user_id: Uuid) -> Result<Option<SubscriptionEpisodeEntity>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let episode = subscription_episodes::table
            .filter(subscription_episodes::user_id.eq(user_id))
            .filter(subscription_episodes::status.eq_any(EpisodeStatus::live_values()))
            .order(subscription_episodes::created_at.desc())
            .select(SubscriptionEpisodeEntity::as_select())
            .first::<SubscriptionEpisodeEntity>(&mut conn)
            .optional()?;

        Ok(episode)
    }

    async fn find_by_id(&self, episode_id: Uuid) -> Result<Option<SubscriptionEpisodeEntity>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let episode = subscription_episodes::table
            .filter(subscription_episodes::id.eq(episode_id))
            .select(SubscriptionEpisodeEntity::as_select())
            .first::<SubscriptionEpisodeEntity>(&mut conn)
            .optional()?;

        Ok(episode)
    }

    async fn find_latest_by_remote_subscription_id(
        &self,
        remote_subscription_id: &str,
    ) -> Result<Option<SubscriptionEpisodeEntity>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let episode = subscription_episodes::table
            .filter(subscription_episodes::remote_subscription_id.eq(remote_subscription_id))
            .order(subscription_episodes::created_at.desc())
            .select(SubscriptionEpisodeEntity::as_select())
            .first::<SubscriptionEpisodeEntity>(&mut conn)
            .optional()?;

        Ok(episode)
    }

    async fn commit_reconciliation(
        &self,
        episode: EpisodeUpdate,
        entitlement: EntitlementUpdate,
    ) -> Result<bool> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let result = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            if write_episode(conn, &episode)? != 1 {
                return Err(diesel::result::Error::RollbackTransaction);
            }

            let student_rows = update(
                students::table
                    .filter(students::id.eq(entitlement.student_id))
                    .filter(students::entitlement_version.eq(entitlement.expected_version)),
            )
            .set((
                students::active_episode_id.eq(entitlement.active_episode_id),
                students::remaining_enrollment_credits
                    .eq(entitlement.remaining_enrollment_credits),
                students::entitlement_version.eq(students::entitlement_version + 1),
                students::updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;
            if student_rows != 1 {
                return Err(diesel::result::Error::RollbackTransaction);
            }

            if let Some(previous) = entitlement.supersede_episode_id {
                supersede_live_episode(conn, previous)?;
            }

            Ok(())
        });

        match result {
            Ok(()) => Ok(true),
            Err(diesel::result::Error::RollbackTransaction) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn count_active_by_price(&self) -> Result<Vec<(String, i64)>> {
        let mut conn = Arc::clone(&self.db_pool).get()?;

        let counts = subscription_episodes::table
            .filter(subscription_episodes::status.eq(EpisodeStatus::Active.as_str()))
            .group_by(subscription_episodes::price_id)
            .select((subscription_episodes::price_id, count_star()))
            .load::<(String, i64)>(&mut conn)?;

        Ok(counts)
    }
}
