//! Core domain types for the points ledger.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Economic event categories recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Purchase,
    SubscriptionRenewal,
    SubscriptionCredit,
    PromoCredit,
    AdminAdjustment,
    ReconcileAdjustment,
    Refund,
    Chargeback,
    Spend,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Purchase => "purchase",
            LedgerKind::SubscriptionRenewal => "subscription_renewal",
            LedgerKind::SubscriptionCredit => "subscription_credit",
            LedgerKind::PromoCredit => "promo_credit",
            LedgerKind::AdminAdjustment => "admin_adjustment",
            LedgerKind::ReconcileAdjustment => "reconcile_adjustment",
            LedgerKind::Refund => "refund",
            LedgerKind::Chargeback => "chargeback",
            LedgerKind::Spend => "spend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "purchase" => Some(LedgerKind::Purchase),
            "subscription_renewal" => Some(LedgerKind::SubscriptionRenewal),
            "subscription_credit" => Some(LedgerKind::SubscriptionCredit),
            "promo_credit" => Some(LedgerKind::PromoCredit),
            "admin_adjustment" => Some(LedgerKind::AdminAdjustment),
            "reconcile_adjustment" => Some(LedgerKind::ReconcileAdjustment),
            "refund" => Some(LedgerKind::Refund),
            "chargeback" => Some(LedgerKind::Chargeback),
            "spend" => Some(LedgerKind::Spend),
            _ => None,
        }
    }

    /// Promo-kind credits carry an expiry and count against the daily
    /// promo-redemption velocity rule.
    pub fn is_promo(&self) -> bool {
        matches!(self, LedgerKind::PromoCredit)
    }
}

impl std::fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Balance snapshot row. Mutated only inside ledger transactions.
///
/// `promo_balance` is refreshed from the live lot sum inside every
/// balance-mutating transaction; between transactions it can lag behind lot
/// expiry, which is why balance reads recompute promo from the lots.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Wallet {
    pub user_id: String,
    pub paid_balance: i64,
    pub promo_balance: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Live balance view returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct WalletBalance {
    pub user_id: String,
    pub paid_balance: i64,
    pub promo_balance: i64,
    pub total: i64,
}

/// A batch of promotional points with its own expiry.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PromoLot {
    pub id: Uuid,
    pub user_id: String,
    pub initial_points: i64,
    pub remaining_points: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub granted_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Append-only ledger row. Immutable once written.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: String,
    /// Signed total delta; always `paid_delta + promo_delta`.
    pub amount: i64,
    pub paid_delta: i64,
    pub promo_delta: i64,
    /// Total balance (paid plus unexpired promo) after this entry.
    pub balance_after: i64,
    pub currency: String,
    pub kind: String,
    pub source: JsonValue,
    pub action_id: String,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of a credit. `deduplicated` is set when the action id had already
/// been applied and the prior entry is being returned.
#[derive(Debug, Clone, Serialize)]
pub struct CreditOutcome {
    pub ledger_id: Uuid,
    pub new_balance: i64,
    pub deduplicated: bool,
}

/// Result of a spend, with the promo/paid split actually applied.
#[derive(Debug, Clone, Serialize)]
pub struct SpendOutcome {
    pub ledger_id: Uuid,
    pub new_balance: i64,
    pub promo_spent: i64,
    pub paid_spent: i64,
    pub deduplicated: bool,
}

/// Read-only dry run of a spend.
#[derive(Debug, Clone, Serialize)]
pub struct SpendPreview {
    pub balance_before: i64,
    pub balance_after: i64,
    pub promo_spent: i64,
    pub paid_spent: i64,
    pub promo_available: i64,
    pub paid_available: i64,
    pub sufficient: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_kind_strings_are_stable() {
        assert_eq!(LedgerKind::Purchase.as_str(), "purchase");
        assert_eq!(LedgerKind::SubscriptionRenewal.as_str(), "subscription_renewal");
        assert_eq!(LedgerKind::ReconcileAdjustment.as_str(), "reconcile_adjustment");
        assert_eq!(LedgerKind::Spend.as_str(), "spend");
    }

    #[test]
    fn ledger_kind_parse_inverts_as_str() {
        for kind in [
            LedgerKind::Purchase,
            LedgerKind::SubscriptionRenewal,
            LedgerKind::SubscriptionCredit,
            LedgerKind::PromoCredit,
            LedgerKind::AdminAdjustment,
            LedgerKind::ReconcileAdjustment,
            LedgerKind::Refund,
            LedgerKind::Chargeback,
            LedgerKind::Spend,
        ] {
            assert_eq!(LedgerKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LedgerKind::parse("mystery"), None);
    }

    #[test]
    fn promo_kind_flag() {
        assert!(LedgerKind::PromoCredit.is_promo());
        assert!(!LedgerKind::Purchase.is_promo());
        assert!(!LedgerKind::SubscriptionCredit.is_promo());
    }

    #[test]
    fn ledger_kind_serde_matches_column_values() {
        let json = serde_json::to_string(&LedgerKind::SubscriptionCredit).unwrap();
        assert_eq!(json, "\"subscription_credit\"");
        let parsed: LedgerKind = serde_json::from_str("\"admin_adjustment\"").unwrap();
        assert_eq!(parsed, LedgerKind::AdminAdjustment);
    }
}
