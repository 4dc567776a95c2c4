use serde::Serialize;
use thiserror::Error;

use crate::domain::value_objects::enums::plan_names::PlanName;

/// Billing-provider price identifiers, one per plan. Loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPrices {
    pub daily: String,
    pub bronze: String,
    pub silver: String,
    pub gold: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub name: PlanName,
    pub price_id: String,
    pub enrollment_credits: i32,
    pub display_price: &'static str,
    pub color: &'static str,
}

impl PlanEntry {
    pub fn details(&self) -> PlanDetailsDto {
        PlanDetailsDto {
            name: self.name.to_string(),
            price: self.display_price.to_string(),
            course_limit: self.enrollment_credits,
            color: self.color.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanDetailsDto {
    pub name: String,
    pub price: String,
    pub course_limit: i32,
    pub color: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Invalid plan: {0}")]
    UnknownPlan(String),
    #[error("no plan is configured for price {0}")]
    UnknownPrice(String),
}

/// Closed set of purchasable plans. Pure lookup, no state beyond configuration.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    entries: Vec<PlanEntry>,
}

impl PlanCatalog {
    pub fn new(prices: PlanPrices) -> Self {
        let entries = vec![
            PlanEntry {
                name: PlanName::Daily,
                price_id: prices.daily,
                enrollment_credits: 2,
                display_price: "$10",
                color: "#F0BF00",
            },
            PlanEntry {
                name: PlanName::Bronze,
                price_id: prices.bronze,
                enrollment_credits: 4,
                display_price: "$170",
                color: "#391802",
            },
            PlanEntry {
                name: PlanName::Silver,
                price_id: prices.silver,
                enrollment_credits: 8,
                display_price: "$200",
                color: "#A8A9AD",
            },
            PlanEntry {
                name: PlanName::Gold,
                price_id: prices.gold,
                enrollment_credits: 12,
                display_price: "$250",
                color: "#FFBF00",
            },
        ];

        Self { entries }
    }

    pub fn resolve(&self, plan_name: &str) -> Result<&PlanEntry, CatalogError> {
        PlanName::from_str(plan_name)
            .map(|name| self.entry(name))
            .ok_or_else(|| CatalogError::UnknownPlan(plan_name.to_string()))
    }

    pub fn entry(&self, name: PlanName) -> &PlanEntry {
        // `new` inserts one entry per PlanName in declaration order.
        &self.entries[name as usize]
    }

    pub fn by_price(&self, price_id: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|entry| entry.price_id == price_id)
    }

    pub fn credit_grant_for_price(&self, price_id: &str) -> Result<i32, CatalogError> {
        self.by_price(price_id)
            .map(|entry| entry.enrollment_credits)
            .ok_or_else(|| CatalogError::UnknownPrice(price_id.to_string()))
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }
}
