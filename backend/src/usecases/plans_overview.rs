use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use lms::domain::{
    repositories::subscription_episodes::SubscriptionLedgerRepository,
    value_objects::{plans::PlanCatalog, subscriptions::PlanCountDto},
};
use tracing::error;

/// Active subscriptions per plan, counted from the ledger at query time.
pub struct PlansOverviewUseCase<L>
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
{
    ledger_repo: Arc<L>,
    catalog: Arc<PlanCatalog>,
}

impl<L> PlansOverviewUseCase<L>
where
    L: SubscriptionLedgerRepository + Send + Sync + 'static,
{
    pub fn new(ledger_repo: Arc<L>, catalog: Arc<PlanCatalog>) -> Self {
        Self {
            ledger_repo,
            catalog,
        }
    }

    pub async fn overview(&self) -> Result<Vec<PlanCountDto>> {
        let counts: HashMap<String, i64> = self
            .ledger_repo
            .count_active_by_price()
            .await
            .map_err(|err| {
                error!(db_error = ?err, "plans_overview: failed to count active episodes");
                err
            })?
            .into_iter()
            .collect();

        Ok(self
            .catalog
            .entries()
            .iter()
            .map(|entry| PlanCountDto {
                name: entry.name.to_string(),
                value: counts.get(&entry.price_id).copied().unwrap_or(0),
            })
            .collect())
    }
}
