use anyhow::Result;
use async_trait::async_trait;
use mockall::automock;
use uuid::Uuid;

use crate::domain::{
    entities::subscription_episodes::{
        EpisodeUpdate, InsertSubscriptionEpisodeEntity, SubscriptionEpisodeEntity,
    },
    value_objects::entitlements::EntitlementUpdate,
};

#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeCreation {
    Created(SubscriptionEpisodeEntity),
    /// The user already holds a live episode; nothing was inserted.
    LiveEpisodeExists(SubscriptionEpisodeEntity),
}

/// Append-mostly ledger of billing attempts. Every conditional write returns
/// `false` when the row moved past the expected version.
#[automock]
#[async_trait]
pub trait SubscriptionLedgerRepository {
    /// Inserts a `pending` episode unless the user already has a live one other
    /// than `superseding`. Serialized per user.
    async fn create_episode(
        &self,
        insert_episode: InsertSubscriptionEpisodeEntity,
        superseding: Option<Uuid>,
    ) -> Result<EpisodeCreation>;

    async fn update_episode(&self, update: EpisodeUpdate) -> Result<bool>;

    /// Moves a live episode to `updated-to-other-plan`. No-op for terminal rows.
    async fn mark_superseded(&self, episode_id: Uuid) -> Result<()>;

    async fn find_live_episode(&self, user_id: Uuid) -> Result<Option<SubscriptionEpisodeEntity>>;

    async fn find_by_id(&self, episode_id: Uuid) -> Result<Option<SubscriptionEpisodeEntity>>;

    async fn find_latest_by_remote_subscription_id(
        &self,
        remote_subscription_id: &str,
    ) -> Result<Option<SubscriptionEpisodeEntity>>;

    /// Writes the episode and the owner's entitlement in one transaction.
    async fn commit_reconciliation(
        &self,
        episode: EpisodeUpdate,
        entitlement: EntitlementUpdate,
    ) -> Result<bool>;

    /// `(price_id, count)` for every price with at least one `active` episode.
    async fn count_active_by_price(&self) -> Result<Vec<(String, i64)>>;
}
