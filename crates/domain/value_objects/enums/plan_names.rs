use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PlanName {
    Daily,
    Bronze,
    Silver,
    Gold,
}

impl PlanName {
    pub const ALL: [PlanName; 4] = [
        PlanName::Daily,
        PlanName::Bronze,
        PlanName::Silver,
        PlanName::Gold,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanName::Daily => "Daily",
            PlanName::Bronze => "Bronze",
            PlanName::Silver => "Silver",
            PlanName::Gold => "Gold",
        }
    }

    /// Plan names are matched exactly; clients send the capitalised form.
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "Daily" => Some(PlanName::Daily),
            "Bronze" => Some(PlanName::Bronze),
            "Silver" => Some(PlanName::Silver),
            "Gold" => Some(PlanName::Gold),
            _ => None,
        }
    }
}

impl Display for PlanName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
