use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a subscription episode. Mirrors the billing provider's
/// subscription statuses plus the two local-only states `pending` and
/// `updated-to-other-plan`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Pending,
    Active,
    PastDue,
    Incomplete,
    IncompleteExpired,
    Canceled,
    Unpaid,
    #[serde(rename = "updated-to-other-plan")]
    UpdatedToOtherPlan,
}

impl EpisodeStatus {
    pub const LIVE: [EpisodeStatus; 4] = [
        EpisodeStatus::Pending,
        EpisodeStatus::Active,
        EpisodeStatus::PastDue,
        EpisodeStatus::Incomplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Pending => "pending",
            EpisodeStatus::Active => "active",
            EpisodeStatus::PastDue => "past_due",
            EpisodeStatus::Incomplete => "incomplete",
            EpisodeStatus::IncompleteExpired => "incomplete_expired",
            EpisodeStatus::Canceled => "canceled",
            EpisodeStatus::Unpaid => "unpaid",
            EpisodeStatus::UpdatedToOtherPlan => "updated-to-other-plan",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EpisodeStatus::Pending),
            "active" => Some(EpisodeStatus::Active),
            "past_due" => Some(EpisodeStatus::PastDue),
            "incomplete" => Some(EpisodeStatus::Incomplete),
            "incomplete_expired" => Some(EpisodeStatus::IncompleteExpired),
            "canceled" => Some(EpisodeStatus::Canceled),
            "unpaid" => Some(EpisodeStatus::Unpaid),
            "updated-to-other-plan" => Some(EpisodeStatus::UpdatedToOtherPlan),
            _ => None,
        }
    }

    /// Live episodes occupy the per-user slot; at most one may exist at a time.
    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }

    /// Terminal states that a later observation of a different status cannot leave.
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            EpisodeStatus::Canceled | EpisodeStatus::UpdatedToOtherPlan
        )
    }

    /// Statuses that keep subscriber-only features open (past_due is the grace window).
    pub fn grants_access(&self) -> bool {
        matches!(self, EpisodeStatus::Active | EpisodeStatus::PastDue)
    }

    pub fn live_values() -> Vec<&'static str> {
        Self::LIVE.iter().map(EpisodeStatus::as_str).collect()
    }
}

impl Display for EpisodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
