//! Small enums shared across the workspace.

use serde::{Deserialize, Serialize};

/// Billing cycle of a subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanCycle {
    Month,
    Year,
}

impl PlanCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanCycle::Month => "month",
            PlanCycle::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "month" | "monthly" => Some(PlanCycle::Month),
            "year" | "annual" | "yearly" => Some(PlanCycle::Year),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which balance a configured credit lands in.
///
/// Paid points never expire; promo points are granted as a lot with an
/// expiry date and are consumed before paid points on spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditDestination {
    Paid,
    Promo,
}

impl CreditDestination {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditDestination::Paid => "paid",
            CreditDestination::Promo => "promo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paid" => Some(CreditDestination::Paid),
            "promo" => Some(CreditDestination::Promo),
            _ => None,
        }
    }
}

impl std::fmt::Display for CreditDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_cycle_parses_aliases() {
        assert_eq!(PlanCycle::parse("month"), Some(PlanCycle::Month));
        assert_eq!(PlanCycle::parse("Monthly"), Some(PlanCycle::Month));
        assert_eq!(PlanCycle::parse("annual"), Some(PlanCycle::Year));
        assert_eq!(PlanCycle::parse("YEAR"), Some(PlanCycle::Year));
        assert_eq!(PlanCycle::parse("weekly"), None);
    }

    #[test]
    fn credit_destination_round_trips() {
        assert_eq!(
            CreditDestination::parse("paid"),
            Some(CreditDestination::Paid)
        );
        assert_eq!(
            CreditDestination::parse(" Promo "),
            Some(CreditDestination::Promo)
        );
        assert_eq!(CreditDestination::parse("bonus"), None);
        assert_eq!(CreditDestination::Promo.as_str(), "promo");
    }
}
