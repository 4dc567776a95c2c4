use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use lms::{
    domain::{
        entities::subscription_episodes::SubscriptionEpisodeEntity,
        repositories::{
            students::StudentRepository, subscription_episodes::SubscriptionLedgerRepository,
        },
        value_objects::{
            entitlements::{
                EPISODE_METADATA_KEY, Entitlement, Reconciliation, RemoteObservation,
                StaleReason, reconcile,
            },
            enums::episode_statuses::EpisodeStatus,
            plans::{CatalogError, PlanCatalog},
        },
    },
    payments::stripe_client::StripeSubscription,
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Conditional writes lost to a concurrent writer are retried from fresh state this many times.
pub const MAX_APPLY_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("subscription episode {0} not found")]
    EpisodeNotFound(Uuid),
    #[error("student {0} not found")]
    StudentNotFound(Uuid),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("episode {0} kept changing underneath {1} attempts")]
    Contention(Uuid, usize),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied {
        episode: SubscriptionEpisodeEntity,
        entitlement: Entitlement,
    },
    Stale {
        reason: StaleReason,
        episode: SubscriptionEpisodeEntity,
        entitlement: Entitlement,
    },
}

impl ApplyOutcome {
    pub fn episode(&self) -> &SubscriptionEpisodeEntity {
        match self {
            ApplyOutcome::Applied { episode, .. } | ApplyOutcome::Stale { episode, .. } => episode,
        }
    }

    pub fn entitlement(&self) -> Entitlement {
        match self {
            ApplyOutcome::Applied { entitlement, .. }
            | ApplyOutcome::Stale { entitlement, .. } => *entitlement,
        }
    }
}

fn timestamp(seconds: Option<i64>) -> Option<DateTime<Utc>> {
    seconds.and_then(|value| Utc.timestamp_opt(value, 0).single())
}

/// Reads a remote subscription as an observation made at `observed_at`.
/// `None` when the provider reports a status the ledger does not model.
pub fn observation_from_subscription(
    subscription: &StripeSubscription,
    observed_at: DateTime<Utc>,
) -> Option<RemoteObservation> {
    let status = EpisodeStatus::from_str(&subscription.status)?;

    Some(RemoteObservation {
        status,
        remote_subscription_id: Some(subscription.id.clone()),
        billing_cycle_anchor: timestamp(subscription.billing_cycle_anchor),
        current_period_start: timestamp(subscription.period_start()),
        current_period_end: timestamp(subscription.period_end()),
        trial_ends_at: timestamp(subscription.trial_end),
        ended_at: timestamp(subscription.ended_at),
        observed_at,
    })
}

pub fn episode_id_from_metadata(subscription: &StripeSubscription) -> Option<Uuid> {
    subscription
        .metadata
        .get(EPISODE_METADATA_KEY)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

/// Persists what `reconcile` decides. The only writer of entitlement columns
/// besides the enrollment credit decrement.
pub struct EntitlementReconciler<L, St>
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
{
    ledger_repo: Arc<L>,
    student_repo: Arc<St>,
    catalog: Arc<PlanCatalog>,
}

impl<L, St> EntitlementReconciler<L, St>
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
    St: StudentRepository + Send + Sync + 'static,
{
    pub fn new(ledger_repo: Arc<L>, student_repo: Arc<St>, catalog: Arc<PlanCatalog>) -> Self {
        Self {
            ledger_repo,
            student_repo,
            catalog,
        }
    }

    pub async fn apply(
        &self,
        episode_id: Uuid,
        observation: RemoteObservation,
    ) -> Result<ApplyOutcome, ReconcileError> {
        for attempt in 1..=MAX_APPLY_ATTEMPTS {
            let episode = self
                .ledger_repo
                .find_by_id(episode_id)
                .await?
                .ok_or(ReconcileError::EpisodeNotFound(episode_id))?;
            let student = self
                .student_repo
                .find_by_id(episode.user_id)
                .await?
                .ok_or(ReconcileError::StudentNotFound(episode.user_id))?;

            let decision =
                reconcile(&student, &episode, &observation, &self.catalog).map_err(|err| {
                    error!(
                        %episode_id,
                        price_id = %episode.price_id,
                        error = %err,
                        "reconciler: episode price is not in the plan catalog"
                    );
                    err
                })?;

            match decision {
                Reconciliation::Stale(reason) => {
                    info!(
                        %episode_id,
                        %reason,
                        observed_status = %observation.status,
                        observed_at = %observation.observed_at,
                        "reconciler: stale observation discarded"
                    );
                    return Ok(ApplyOutcome::Stale {
                        reason,
                        entitlement: student.entitlement(),
                        episode,
                    });
                }
                Reconciliation::Apply {
                    episode: episode_update,
                    entitlement: None,
                } => {
                    if self.ledger_repo.update_episode(episode_update.clone()).await? {
                        info!(
                            %episode_id,
                            status = %episode_update.status,
                            "reconciler: episode updated, entitlement unchanged"
                        );
                        return Ok(ApplyOutcome::Applied {
                            episode: episode.with_update(&episode_update),
                            entitlement: student.entitlement(),
                        });
                    }
                }
                Reconciliation::Diverged {
                    episode: episode_update,
                    active_episode_id,
                } => {
                    if self.ledger_repo.update_episode(episode_update.clone()).await? {
                        error!(
                            %episode_id,
                            user_id = %student.id,
                            %active_episode_id,
                            status = %episode_update.status,
                            remote_subscription_id = ?episode_update.remote_subscription_id,
                            "reconciler: consistency divergence, retired episode reported active while another holds the entitlement"
                        );
                        return Ok(ApplyOutcome::Applied {
                            episode: episode.with_update(&episode_update),
                            entitlement: student.entitlement(),
                        });
                    }
                }
                Reconciliation::Apply {
                    episode: episode_update,
                    entitlement: Some(entitlement_update),
                } => {
                    if self
                        .ledger_repo
                        .commit_reconciliation(episode_update.clone(), entitlement_update.clone())
                        .await?
                    {
                        info!(
                            %episode_id,
                            user_id = %student.id,
                            status = %episode_update.status,
                            active_episode_id = ?entitlement_update.active_episode_id,
                            remaining_enrollment_credits =
                                entitlement_update.remaining_enrollment_credits,
                            superseded_episode_id = ?entitlement_update.supersede_episode_id,
                            "reconciler: entitlement updated"
                        );
                        return Ok(ApplyOutcome::Applied {
                            episode: episode.with_update(&episode_update),
                            entitlement: entitlement_update.entitlement(),
                        });
                    }
                }
            }

            warn!(
                %episode_id,
                attempt,
                "reconciler: concurrent write detected, reloading"
            );
        }

        Err(ReconcileError::Contention(episode_id, MAX_APPLY_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lms::domain::{
        entities::students::StudentEntity,
        repositories::{
            students::MockStudentRepository,
            subscription_episodes::MockSubscriptionLedgerRepository,
        },
        value_objects::plans::PlanPrices,
    };

    fn catalog() -> Arc<PlanCatalog> {
        Arc::new(PlanCatalog::new(PlanPrices {
            daily: "price_daily".to_string(),
            bronze: "price_bronze".to_string(),
            silver: "price_silver".to_string(),
            gold: "price_gold".to_string(),
        }))
    }

    fn student(id: Uuid) -> StudentEntity {
        StudentEntity {
            id,
            email: "student@example.com".to_string(),
            first_name: "Test".to_string(),
            last_name: "Student".to_string(),
            customer_id: Some("cus_1".to_string()),
            active_episode_id: None,
            remaining_enrollment_credits: 0,
            entitlement_version: 4,
        }
    }

    fn episode(id: Uuid, user_id: Uuid) -> SubscriptionEpisodeEntity {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        SubscriptionEpisodeEntity {
            id,
            user_id,
            remote_customer_id: "cus_1".to_string(),
            remote_subscription_id: None,
            price_id: "price_silver".to_string(),
            status: "pending".to_string(),
            billing_cycle_anchor: None,
            current_period_start: None,
            current_period_end: None,
            trial_ends_at: None,
            ended_at: None,
            remote_observed_at: None,
            version: 0,
            created_at: created,
            updated_at: created,
        }
    }

    fn active_now() -> RemoteObservation {
        RemoteObservation::status_only(EpisodeStatus::Active, Utc::now())
    }

    #[tokio::test]
    async fn activation_commits_episode_and_entitlement_together() {
        let user_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();

        let mut ledger = MockSubscriptionLedgerRepository::new();
        let loaded = episode(episode_id, user_id);
        ledger
            .expect_find_by_id()
            .returning(move |_| Ok(Some(loaded.clone())));
        ledger
            .expect_commit_reconciliation()
            .withf(move |episode, entitlement| {
                episode.status == EpisodeStatus::Active
                    && entitlement.active_episode_id == Some(episode_id)
                    && entitlement.remaining_enrollment_credits == 8
                    && entitlement.expected_version == 4
            })
            .times(1)
            .returning(|_, _| Ok(true));
        ledger.expect_update_episode().times(0);

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .returning(move |id| Ok(Some(student(id))));

        let reconciler = EntitlementReconciler::new(Arc::new(ledger), Arc::new(students), catalog());
        let outcome = reconciler.apply(episode_id, active_now()).await.unwrap();

        assert_eq!(
            outcome.entitlement(),
            Entitlement {
                active_episode_id: Some(episode_id),
                remaining_enrollment_credits: 8,
            }
        );
        assert_eq!(outcome.episode().status, "active");
        assert_eq!(outcome.episode().version, 1);
    }

    #[tokio::test]
    async fn lost_race_is_retried_from_fresh_state() {
        let user_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();

        let mut ledger = MockSubscriptionLedgerRepository::new();
        let loaded = episode(episode_id, user_id);
        ledger
            .expect_find_by_id()
            .times(2)
            .returning(move |_| Ok(Some(loaded.clone())));
        let mut calls = 0;
        ledger
            .expect_commit_reconciliation()
            .times(2)
            .returning(move |_, _| {
                calls += 1;
                Ok(calls > 1)
            });

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .times(2)
            .returning(move |id| Ok(Some(student(id))));

        let reconciler = EntitlementReconciler::new(Arc::new(ledger), Arc::new(students), catalog());
        let outcome = reconciler.apply(episode_id, active_now()).await;

        assert!(matches!(outcome, Ok(ApplyOutcome::Applied { .. })));
    }

    #[tokio::test]
    async fn persistent_conflicts_surface_as_contention() {
        let user_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();

        let mut ledger = MockSubscriptionLedgerRepository::new();
        let loaded = episode(episode_id, user_id);
        ledger
            .expect_find_by_id()
            .returning(move |_| Ok(Some(loaded.clone())));
        ledger
            .expect_update_episode()
            .times(MAX_APPLY_ATTEMPTS)
            .returning(|_| Ok(false));

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .returning(move |id| Ok(Some(student(id))));

        let reconciler = EntitlementReconciler::new(Arc::new(ledger), Arc::new(students), catalog());
        let observation = RemoteObservation::status_only(EpisodeStatus::PastDue, Utc::now());
        let outcome = reconciler.apply(episode_id, observation).await;

        assert!(matches!(
            outcome,
            Err(ReconcileError::Contention(id, MAX_APPLY_ATTEMPTS)) if id == episode_id
        ));
    }

    #[tokio::test]
    async fn stale_observation_writes_nothing() {
        let user_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();

        let mut ledger = MockSubscriptionLedgerRepository::new();
        let mut loaded = episode(episode_id, user_id);
        loaded.status = "canceled".to_string();
        loaded.remote_observed_at = Some(Utc::now());
        ledger
            .expect_find_by_id()
            .returning(move |_| Ok(Some(loaded.clone())));
        ledger.expect_update_episode().times(0);
        ledger.expect_commit_reconciliation().times(0);

        let mut students = MockStudentRepository::new();
        students
            .expect_find_by_id()
            .returning(move |id| Ok(Some(student(id))));

        let reconciler = EntitlementReconciler::new(Arc::new(ledger), Arc::new(students), catalog());
        let observation = RemoteObservation::status_only(
            EpisodeStatus::Active,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        let outcome = reconciler.apply(episode_id, observation).await.unwrap();

        assert!(matches!(
            outcome,
            ApplyOutcome::Stale {
                reason: StaleReason::TerminalEpisode,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn divergent_activation_records_status_without_touching_entitlement() {
        let user_id = Uuid::new_v4();
        let episode_id = Uuid::new_v4();
        let live_episode_id = Uuid::new_v4();

        let mut ledger = MockSubscriptionLedgerRepository::new();
        let mut loaded = episode(episode_id, user_id);
        loaded.status = "incomplete_expired".to_string();
        ledger
            .expect_find_by_id()
            .returning(move |_| Ok(Some(loaded.clone())));
        ledger
            .expect_update_episode()
            .withf(move |update| {
                update.episode_id == episode_id && update.status == EpisodeStatus::Active
            })
            .times(1)
            .returning(|_| Ok(true));
        ledger.expect_commit_reconciliation().times(0);
        ledger.expect_mark_superseded().times(0);

        let mut students = MockStudentRepository::new();
        students.expect_find_by_id().returning(move |id| {
            Ok(Some(StudentEntity {
                active_episode_id: Some(live_episode_id),
                remaining_enrollment_credits: 5,
                ..student(id)
            }))
        });

        let reconciler = EntitlementReconciler::new(Arc::new(ledger), Arc::new(students), catalog());
        let outcome = reconciler.apply(episode_id, active_now()).await.unwrap();

        assert_eq!(
            outcome.entitlement(),
            Entitlement {
                active_episode_id: Some(live_episode_id),
                remaining_enrollment_credits: 5,
            }
        );
        assert_eq!(outcome.episode().status, "active");
    }

    #[tokio::test]
    async fn missing_episode_is_reported() {
        let episode_id = Uuid::new_v4();

        let mut ledger = MockSubscriptionLedgerRepository::new();
        ledger.expect_find_by_id().returning(|_| Ok(None));
        let students = MockStudentRepository::new();

        let reconciler = EntitlementReconciler::new(Arc::new(ledger), Arc::new(students), catalog());
        let outcome = reconciler.apply(episode_id, active_now()).await;

        assert!(matches!(outcome, Err(ReconcileError::EpisodeNotFound(id)) if id == episode_id));
    }

    #[test]
    fn reads_observation_from_remote_subscription() {
        let episode_id = Uuid::new_v4();
        let subscription: StripeSubscription = serde_json::from_value(serde_json::json!({
            "id": "sub_9",
            "status": "past_due",
            "billing_cycle_anchor": 1_735_689_600,
            "metadata": { "episode_id": episode_id.to_string() },
            "items": { "data": [
                { "id": "si_1", "current_period_start": 1_735_689_600, "current_period_end": 1_738_368_000 }
            ] }
        }))
        .unwrap();
        let now = Utc::now();

        let observation = observation_from_subscription(&subscription, now).unwrap();

        assert_eq!(observation.status, EpisodeStatus::PastDue);
        assert_eq!(observation.remote_subscription_id.as_deref(), Some("sub_9"));
        assert_eq!(
            observation.current_period_end,
            Utc.timestamp_opt(1_738_368_000, 0).single()
        );
        assert_eq!(observation.observed_at, now);
        assert_eq!(episode_id_from_metadata(&subscription), Some(episode_id));
    }

    #[test]
    fn unmodelled_remote_status_yields_no_observation() {
        let subscription: StripeSubscription = serde_json::from_value(serde_json::json!({
            "id": "sub_9",
            "status": "trialing"
        }))
        .unwrap();

        assert!(observation_from_subscription(&subscription, Utc::now()).is_none());
        assert_eq!(episode_id_from_metadata(&subscription), None);
    }
}
