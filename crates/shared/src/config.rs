//! Read-only configuration snapshot for the points subsystem.
//!
//! Loaded once at startup from environment variables and handed to services
//! by value. The product map and plan table are the authoritative mapping
//! from PayNow product ids to point amounts; nothing in the core consults
//! the environment after startup.

use std::collections::HashMap;

use crate::types::{CreditDestination, PlanCycle};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {detail}")]
    InvalidVar { var: &'static str, detail: String },
}

/// Subscription plan as configured, keyed by PayNow product id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanConfig {
    pub name: String,
    pub cycle: PlanCycle,
    pub points_per_cycle: i64,
}

/// Velocity-rule ceilings and the hold threshold.
#[derive(Debug, Clone)]
pub struct VelocityLimits {
    /// Max points credited to one user per rolling hour.
    pub hourly_points: i64,
    /// Max points credited to one user per rolling day.
    pub daily_points: i64,
    /// Max promo redemptions per user per rolling day.
    pub daily_promo_redemptions: i64,
    /// Max points credited per source IP per rolling hour.
    pub ip_hourly_points: i64,
    /// Distinct accounts allowed to share one provider customer id.
    pub shared_customer_max_users: i64,
    /// Account age below which the fresh-account rule applies, minutes.
    pub new_account_age_minutes: i64,
    /// Hourly points that trip the fresh-account rule.
    pub new_account_hourly_points: i64,
    /// Summed risk score at or above which a credit is held.
    pub hold_threshold: u32,
}

impl Default for VelocityLimits {
    fn default() -> Self {
        Self {
            hourly_points: 200,
            daily_points: 800,
            daily_promo_redemptions: 3,
            ip_hourly_points: 500,
            shared_customer_max_users: 2,
            new_account_age_minutes: 60,
            new_account_hourly_points: 100,
            hold_threshold: 50,
        }
    }
}

/// Immutable configuration consumed by the points core.
#[derive(Debug, Clone)]
pub struct PointsConfig {
    /// Shared secret for PayNow webhook signatures.
    pub webhook_secret: String,
    /// One-time product id -> points granted.
    pub product_points: HashMap<String, i64>,
    /// Subscription product id -> plan.
    pub subscription_plans: HashMap<String, PlanConfig>,
    /// Permit spends to drive the paid balance negative.
    pub allow_negative_balance: bool,
    /// Gate webhook credits through the risk engine.
    pub risk_holds_enabled: bool,
    /// Run the nightly reconciliation sweep.
    pub reconciliation_enabled: bool,
    /// Queue messages below this schema version are dropped, not retried.
    pub min_schema_version: u32,
    /// Where subscription cycle credits land.
    pub subscription_points_kind: CreditDestination,
    /// Expiry window for promo-destination credits, in days.
    pub subscription_promo_expiry_days: i64,
    /// Process webhook events inline instead of publishing to the queue.
    pub webhook_inline_processing: bool,
    pub velocity: VelocityLimits,
}

impl PointsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let webhook_secret = std::env::var("PAYNOW_WEBHOOK_SECRET")
            .map_err(|_| ConfigError::MissingVar("PAYNOW_WEBHOOK_SECRET"))?;

        let product_points = parse_points_map(
            &std::env::var("PAYNOW_PRODUCT_POINTS").unwrap_or_default(),
        )
        .map_err(|detail| ConfigError::InvalidVar {
            var: "PAYNOW_PRODUCT_POINTS",
            detail,
        })?;

        let subscription_plans = parse_plan_table(
            &std::env::var("PAYNOW_SUBSCRIPTION_PLANS").unwrap_or_default(),
        )
        .map_err(|detail| ConfigError::InvalidVar {
            var: "PAYNOW_SUBSCRIPTION_PLANS",
            detail,
        })?;

        let subscription_points_kind = match std::env::var("SUBSCRIPTION_POINTS_KIND") {
            Ok(raw) => CreditDestination::parse(&raw).ok_or_else(|| ConfigError::InvalidVar {
                var: "SUBSCRIPTION_POINTS_KIND",
                detail: format!("expected 'paid' or 'promo', got '{raw}'"),
            })?,
            Err(_) => CreditDestination::Paid,
        };

        Ok(Self {
            webhook_secret,
            product_points,
            subscription_plans,
            allow_negative_balance: env_bool("ALLOW_NEGATIVE_BALANCE", false)?,
            risk_holds_enabled: env_bool("RISK_HOLDS_ENABLED", true)?,
            reconciliation_enabled: env_bool("RECONCILIATION_ENABLED", true)?,
            min_schema_version: env_parse("QUEUE_MIN_SCHEMA_VERSION", 1u32)?,
            subscription_points_kind,
            subscription_promo_expiry_days: env_parse("SUBSCRIPTION_PROMO_EXPIRY_DAYS", 45i64)?,
            webhook_inline_processing: env_bool("WEBHOOK_INLINE_PROCESSING", true)?,
            velocity: VelocityLimits {
                hourly_points: env_parse("VELOCITY_HOURLY_POINTS", 200i64)?,
                daily_points: env_parse("VELOCITY_DAILY_POINTS", 800i64)?,
                daily_promo_redemptions: env_parse("VELOCITY_DAILY_PROMO_REDEMPTIONS", 3i64)?,
                ip_hourly_points: env_parse("VELOCITY_IP_HOURLY_POINTS", 500i64)?,
                shared_customer_max_users: env_parse("VELOCITY_SHARED_CUSTOMER_MAX_USERS", 2i64)?,
                new_account_age_minutes: env_parse("VELOCITY_NEW_ACCOUNT_AGE_MINUTES", 60i64)?,
                new_account_hourly_points: env_parse("VELOCITY_NEW_ACCOUNT_HOURLY_POINTS", 100i64)?,
                hold_threshold: env_parse("RISK_HOLD_THRESHOLD", 50u32)?,
            },
        })
    }

    /// Points granted by a one-time product, if configured.
    pub fn points_for_product(&self, product_id: &str) -> Option<i64> {
        self.product_points.get(product_id).copied()
    }

    /// Plan for a subscription product, if configured.
    pub fn plan_for_product(&self, product_id: &str) -> Option<&PlanConfig> {
        self.subscription_plans.get(product_id)
    }
}

/// Parse `"prod_a:50,prod_b:120"` into a product -> points map.
pub fn parse_points_map(raw: &str) -> Result<HashMap<String, i64>, String> {
    let mut map = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (product, points) = entry
            .split_once(':')
            .ok_or_else(|| format!("entry '{entry}' is not 'product:points'"))?;
        let points: i64 = points
            .trim()
            .parse()
            .map_err(|_| format!("points in '{entry}' is not an integer"))?;
        if points <= 0 {
            return Err(format!("points in '{entry}' must be positive"));
        }
        map.insert(product.trim().to_string(), points);
    }
    Ok(map)
}

/// Parse `"prod_x:pro:month:100,prod_y:pro:year:100"` into the plan table.
pub fn parse_plan_table(raw: &str) -> Result<HashMap<String, PlanConfig>, String> {
    let mut map = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(format!(
                "entry '{entry}' is not 'product:name:cycle:points'"
            ));
        }
        let cycle = PlanCycle::parse(parts[2])
            .ok_or_else(|| format!("cycle in '{entry}' must be month or year"))?;
        let points_per_cycle: i64 = parts[3]
            .parse()
            .map_err(|_| format!("points in '{entry}' is not an integer"))?;
        if points_per_cycle <= 0 {
            return Err(format!("points in '{entry}' must be positive"));
        }
        map.insert(
            parts[0].to_string(),
            PlanConfig {
                name: parts[1].to_string(),
                cycle,
                points_per_cycle,
            },
        );
    }
    Ok(map)
}

fn env_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidVar {
                var,
                detail: format!("expected a boolean, got '{other}'"),
            }),
        },
        Err(_) => Ok(default),
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidVar {
            var,
            detail: format!("could not parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_map_parses_entries() {
        let map = parse_points_map("prod_basic:50, prod_plus:120").unwrap();
        assert_eq!(map.get("prod_basic"), Some(&50));
        assert_eq!(map.get("prod_plus"), Some(&120));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn points_map_empty_is_empty() {
        assert!(parse_points_map("").unwrap().is_empty());
        assert!(parse_points_map("  ,  ").unwrap().is_empty());
    }

    #[test]
    fn points_map_rejects_garbage() {
        assert!(parse_points_map("prod_basic").is_err());
        assert!(parse_points_map("prod_basic:lots").is_err());
        assert!(parse_points_map("prod_basic:-5").is_err());
    }

    #[test]
    fn plan_table_parses_entries() {
        let table = parse_plan_table("prod_pro_m:pro:month:100,prod_pro_y:pro:year:100").unwrap();
        let monthly = table.get("prod_pro_m").unwrap();
        assert_eq!(monthly.name, "pro");
        assert_eq!(monthly.cycle, PlanCycle::Month);
        assert_eq!(monthly.points_per_cycle, 100);
        assert_eq!(table.get("prod_pro_y").unwrap().cycle, PlanCycle::Year);
    }

    #[test]
    fn plan_table_rejects_bad_cycle() {
        assert!(parse_plan_table("prod_x:pro:fortnight:100").is_err());
        assert!(parse_plan_table("prod_x:pro:month").is_err());
    }

    #[test]
    #[serial_test::serial]
    fn from_env_reads_snapshot() {
        std::env::set_var("PAYNOW_WEBHOOK_SECRET", "whsec_test");
        std::env::set_var("PAYNOW_PRODUCT_POINTS", "prod_basic:50");
        std::env::set_var("PAYNOW_SUBSCRIPTION_PLANS", "prod_pro_m:pro:month:100");
        std::env::set_var("ALLOW_NEGATIVE_BALANCE", "true");
        std::env::remove_var("RISK_HOLD_THRESHOLD");

        let config = PointsConfig::from_env().unwrap();
        assert_eq!(config.webhook_secret, "whsec_test");
        assert_eq!(config.points_for_product("prod_basic"), Some(50));
        assert!(config.plan_for_product("prod_pro_m").is_some());
        assert!(config.allow_negative_balance);
        assert_eq!(config.velocity.hold_threshold, 50);

        std::env::remove_var("PAYNOW_WEBHOOK_SECRET");
        std::env::remove_var("PAYNOW_PRODUCT_POINTS");
        std::env::remove_var("PAYNOW_SUBSCRIPTION_PLANS");
        std::env::remove_var("ALLOW_NEGATIVE_BALANCE");
    }
}
