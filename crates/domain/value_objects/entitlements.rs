use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{
    entities::{
        students::StudentEntity,
        subscription_episodes::{EpisodeUpdate, SubscriptionEpisodeEntity},
    },
    value_objects::{
        enums::episode_statuses::EpisodeStatus,
        plans::{CatalogError, PlanCatalog},
    },
};

/// Metadata key carrying the local episode id on every remote subscription.
/// Webhooks use it to find the episode an event belongs to.
pub const EPISODE_METADATA_KEY: &str = "episode_id";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub active_episode_id: Option<Uuid>,
    pub remaining_enrollment_credits: i32,
}

/// New entitlement columns for a student, applied only while the row still
/// carries `expected_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementUpdate {
    pub student_id: Uuid,
    pub expected_version: i64,
    pub active_episode_id: Option<Uuid>,
    pub remaining_enrollment_credits: i32,
    /// Previously active episode to retire as `updated-to-other-plan` in the same write.
    pub supersede_episode_id: Option<Uuid>,
}

impl EntitlementUpdate {
    pub fn entitlement(&self) -> Entitlement {
        Entitlement {
            active_episode_id: self.active_episode_id,
            remaining_enrollment_credits: self.remaining_enrollment_credits,
        }
    }
}

/// A status read from the billing provider, with the provider's timestamps and
/// the moment the observation was made.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObservation {
    pub status: EpisodeStatus,
    pub remote_subscription_id: Option<String>,
    pub billing_cycle_anchor: Option<DateTime<Utc>>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

impl RemoteObservation {
    pub fn status_only(status: EpisodeStatus, observed_at: DateTime<Utc>) -> Self {
        Self {
            status,
            remote_subscription_id: None,
            billing_cycle_anchor: None,
            current_period_start: None,
            current_period_end: None,
            trial_ends_at: None,
            ended_at: None,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Older than the observation already applied to the episode.
    OutOfOrder,
    /// The episode is canceled or superseded and the observation disagrees.
    TerminalEpisode,
}

impl Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::OutOfOrder => f.write_str("out_of_order"),
            StaleReason::TerminalEpisode => f.write_str("terminal_episode"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Stale(StaleReason),
    Apply {
        episode: EpisodeUpdate,
        entitlement: Option<EntitlementUpdate>,
    },
    /// An episode that had already left the live slot was reported active while
    /// the student's entitlement points at another episode. The status is
    /// recorded; the entitlement and the other episode are left alone.
    Diverged {
        episode: EpisodeUpdate,
        active_episode_id: Uuid,
    },
}

/// Decides what an observed remote status does to an episode and to its owner's
/// entitlement. Pure: the caller persists the returned writes.
///
/// | observed              | entitlement                                          |
/// |-----------------------|------------------------------------------------------|
/// | active                | pointer := episode, credits := plan grant            |
/// | canceled              | pointer := none, credits := 0 (only if pointer = episode) |
/// | anything else         | unchanged                                            |
///
/// A repeated `active` for the pointer episode only resets credits when the
/// billing period has moved forward, so replays are no-ops.
///
/// `canceled` is absorbing: it applies even when older than the last observation,
/// and nothing leaves it afterwards. The final state is therefore the same in
/// whichever order the provider's events arrive.
pub fn reconcile(
    student: &StudentEntity,
    episode: &SubscriptionEpisodeEntity,
    observation: &RemoteObservation,
    catalog: &PlanCatalog,
) -> Result<Reconciliation, CatalogError> {
    let current_status = episode.episode_status();
    if let Some(current) = current_status {
        if current.is_sticky() && current != observation.status {
            return Ok(Reconciliation::Stale(StaleReason::TerminalEpisode));
        }
    }

    let older = episode
        .remote_observed_at
        .is_some_and(|last_observed| observation.observed_at < last_observed);
    let late_cancel = older
        && observation.status == EpisodeStatus::Canceled
        && current_status != Some(EpisodeStatus::Canceled);
    if older && !late_cancel {
        return Ok(Reconciliation::Stale(StaleReason::OutOfOrder));
    }

    if late_cancel {
        // Newer period data already on the row stays; only the cancellation lands.
        let episode_update = EpisodeUpdate {
            remote_subscription_id: episode
                .remote_subscription_id
                .clone()
                .or_else(|| observation.remote_subscription_id.clone()),
            ended_at: observation.ended_at.or(episode.ended_at),
            ..EpisodeUpdate::local_status_change(episode, EpisodeStatus::Canceled)
        };
        let entitlement_update = (student.active_episode_id == Some(episode.id)).then(|| {
            EntitlementUpdate {
                student_id: student.id,
                expected_version: student.entitlement_version,
                active_episode_id: None,
                remaining_enrollment_credits: 0,
                supersede_episode_id: None,
            }
        });
        return Ok(Reconciliation::Apply {
            episode: episode_update,
            entitlement: entitlement_update,
        });
    }

    let episode_update = EpisodeUpdate {
        episode_id: episode.id,
        expected_version: episode.version,
        status: observation.status,
        remote_subscription_id: observation
            .remote_subscription_id
            .clone()
            .or_else(|| episode.remote_subscription_id.clone()),
        billing_cycle_anchor: observation
            .billing_cycle_anchor
            .or(episode.billing_cycle_anchor),
        current_period_start: observation
            .current_period_start
            .or(episode.current_period_start),
        current_period_end: observation.current_period_end.or(episode.current_period_end),
        trial_ends_at: observation.trial_ends_at.or(episode.trial_ends_at),
        ended_at: observation.ended_at.or(episode.ended_at),
        remote_observed_at: Some(observation.observed_at),
    };

    let is_pointer = student.active_episode_id == Some(episode.id);

    if observation.status == EpisodeStatus::Active && !is_pointer {
        let left_slot = !current_status.is_some_and(|status| status.is_live());
        if let Some(active_episode_id) = student.active_episode_id.filter(|_| left_slot) {
            return Ok(Reconciliation::Diverged {
                episode: episode_update,
                active_episode_id,
            });
        }
    }

    let entitlement_update = match observation.status {
        EpisodeStatus::Active => {
            let new_period = match (observation.current_period_start, episode.current_period_start)
            {
                (Some(observed), Some(known)) => observed > known,
                _ => false,
            };

            if !is_pointer || current_status != Some(EpisodeStatus::Active) || new_period {
                Some(EntitlementUpdate {
                    student_id: student.id,
                    expected_version: student.entitlement_version,
                    active_episode_id: Some(episode.id),
                    remaining_enrollment_credits: catalog
                        .credit_grant_for_price(&episode.price_id)?,
                    supersede_episode_id: student
                        .active_episode_id
                        .filter(|previous| *previous != episode.id),
                })
            } else {
                None
            }
        }
        EpisodeStatus::Canceled if is_pointer => Some(EntitlementUpdate {
            student_id: student.id,
            expected_version: student.entitlement_version,
            active_episode_id: None,
            remaining_enrollment_credits: 0,
            supersede_episode_id: None,
        }),
        _ => None,
    };

    Ok(Reconciliation::Apply {
        episode: episode_update,
        entitlement: entitlement_update,
    })
}
