//! Subscription lifecycle and the monthly crediting cadence.
//!
//! Plans are credited monthly regardless of billing cycle: an annual plan
//! is billed once but its points arrive in twelve monthly grants. The cycle
//! sweep claims each due row with a conditional update inside the credit
//! transaction, so overlapping sweeps cannot grant the same month twice.

use std::sync::Arc;

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use qalam_shared::{CreditDestination, PlanConfig, PointsConfig};

use crate::error::PointsResult;
use crate::ledger::{CreditParams, LedgerStore};
use crate::types::LedgerKind;

const SWEEP_BATCH_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub struct SubscriptionEventParams {
    pub user_id: String,
    pub provider_subscription_id: String,
    pub provider_order_id: Option<String>,
    pub product_id: String,
    pub current_period_end: Option<OffsetDateTime>,
    /// Provider event id, recorded in the ledger entry source.
    pub event_id: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionChange {
    pub subscription_id: Uuid,
    /// Points granted by this event; zero when the credit deduplicated.
    pub credited: i64,
    pub new_balance: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub user_id: String,
    pub provider_subscription_id: String,
    pub provider_order_id: Option<String>,
    pub product_id: String,
    pub plan_name: String,
    pub cycle: String,
    pub points_per_cycle: i64,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub next_credit_at: OffsetDateTime,
    pub total_granted: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// One pass of the cycle sweep, for the worker's summary line.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub due: usize,
    pub credited: usize,
    pub skipped: usize,
    pub failed: usize,
    pub points_granted: i64,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    ledger: LedgerStore,
    config: Arc<PointsConfig>,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, ledger: LedgerStore, config: Arc<PointsConfig>) -> Self {
        Self {
            pool,
            ledger,
            config,
        }
    }

    /// First purchase of a plan: upsert the record and grant the first
    /// monthly cycle. Replays keep the existing crediting cadence.
    pub async fn activate_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        params: &SubscriptionEventParams,
        plan: &PlanConfig,
    ) -> PointsResult<SubscriptionChange> {
        let now = OffsetDateTime::now_utc();
        let (subscription_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_id, provider_subscription_id, provider_order_id, product_id,
                 plan_name, cycle, points_per_cycle, status, current_period_end, next_credit_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', $8, $9)
            ON CONFLICT (provider_subscription_id) DO UPDATE SET
                status = 'active',
                provider_order_id = COALESCE(EXCLUDED.provider_order_id, subscriptions.provider_order_id),
                current_period_end = COALESCE(EXCLUDED.current_period_end, subscriptions.current_period_end),
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&params.user_id)
        .bind(&params.provider_subscription_id)
        .bind(&params.provider_order_id)
        .bind(&params.product_id)
        .bind(&plan.name)
        .bind(plan.cycle.as_str())
        .bind(plan.points_per_cycle)
        .bind(params.current_period_end)
        .bind(add_months(now, 1))
        .fetch_one(&mut **tx)
        .await?;

        let outcome = self
            .ledger
            .credit_in_tx(
                tx,
                &CreditParams {
                    user_id: params.user_id.clone(),
                    kind: LedgerKind::SubscriptionCredit,
                    amount: plan.points_per_cycle,
                    source: serde_json::json!({
                        "provider": "paynow",
                        "event_id": params.event_id,
                        "subscription_id": subscription_id,
                        "provider_subscription_id": params.provider_subscription_id,
                        "plan": plan.name,
                    }),
                    action_id: activation_action_id(&params.provider_subscription_id),
                    expires_at: self.promo_expiry(now),
                    created_by: "system:subscription".into(),
                },
            )
            .await?;

        let credited = if outcome.deduplicated {
            0
        } else {
            self.bump_total_granted(tx, subscription_id, plan.points_per_cycle)
                .await?;
            plan.points_per_cycle
        };

        tracing::info!(
            user_id = %params.user_id,
            subscription_id = %subscription_id,
            plan = %plan.name,
            credited = credited,
            "Subscription activated"
        );

        Ok(SubscriptionChange {
            subscription_id,
            credited,
            new_balance: Some(outcome.new_balance),
        })
    }

    /// Renewal webhook: extend the period and grant one cycle. The action
    /// id carries the period end, so a replayed renewal dedupes and leaves
    /// `next_credit_at` alone.
    pub async fn renew_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        params: &SubscriptionEventParams,
        plan: &PlanConfig,
    ) -> PointsResult<SubscriptionChange> {
        let now = OffsetDateTime::now_utc();
        let (subscription_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_id, provider_subscription_id, provider_order_id, product_id,
                 plan_name, cycle, points_per_cycle, status, current_period_end, next_credit_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', $8, $9)
            ON CONFLICT (provider_subscription_id) DO UPDATE SET
                status = 'active',
                current_period_end = COALESCE(EXCLUDED.current_period_end, subscriptions.current_period_end),
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&params.user_id)
        .bind(&params.provider_subscription_id)
        .bind(&params.provider_order_id)
        .bind(&params.product_id)
        .bind(&plan.name)
        .bind(plan.cycle.as_str())
        .bind(plan.points_per_cycle)
        .bind(params.current_period_end)
        .bind(add_months(now, 1))
        .fetch_one(&mut **tx)
        .await?;

        let outcome = self
            .ledger
            .credit_in_tx(
                tx,
                &CreditParams {
                    user_id: params.user_id.clone(),
                    kind: LedgerKind::SubscriptionRenewal,
                    amount: plan.points_per_cycle,
                    source: serde_json::json!({
                        "provider": "paynow",
                        "event_id": params.event_id,
                        "subscription_id": subscription_id,
                        "provider_subscription_id": params.provider_subscription_id,
                        "plan": plan.name,
                    }),
                    action_id: renewal_action_id(
                        &params.provider_subscription_id,
                        params.current_period_end,
                        &params.event_id,
                    ),
                    expires_at: self.promo_expiry(now),
                    created_by: "system:subscription".into(),
                },
            )
            .await?;

        let credited = if outcome.deduplicated {
            0
        } else {
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET next_credit_at = $2, total_granted = total_granted + $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(subscription_id)
            .bind(add_months(now, 1))
            .bind(plan.points_per_cycle)
            .execute(&mut **tx)
            .await?;
            plan.points_per_cycle
        };

        tracing::info!(
            user_id = %params.user_id,
            subscription_id = %subscription_id,
            plan = %plan.name,
            credited = credited,
            "Subscription renewed"
        );

        Ok(SubscriptionChange {
            subscription_id,
            credited,
            new_balance: Some(outcome.new_balance),
        })
    }

    /// Terminal status flip from a cancel/expire webhook. Returns `None`
    /// when the subscription is unknown or already terminal.
    pub async fn mark_terminal_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        provider_subscription_id: &str,
        status: &str,
    ) -> PointsResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = $2, updated_at = NOW()
            WHERE provider_subscription_id = $1 AND status = 'active'
            RETURNING id
            "#,
        )
        .bind(provider_subscription_id)
        .bind(status)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some((id,)) = row {
            tracing::info!(
                subscription_id = %id,
                provider_subscription_id = %provider_subscription_id,
                status = %status,
                "Subscription closed"
            );
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    /// Grant every due monthly cycle. Each subscription is claimed by a
    /// conditional update inside its own transaction; a claim that loses
    /// the race affects nothing and counts as skipped. One subscription's
    /// failure does not stop the pass.
    pub async fn credit_all_due(&self, now: OffsetDateTime) -> PointsResult<SweepSummary> {
        let due: Vec<(Uuid, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT id, next_credit_at
            FROM subscriptions
            WHERE status = 'active' AND next_credit_at <= $1
            ORDER BY next_credit_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(SWEEP_BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SweepSummary {
            due: due.len(),
            ..Default::default()
        };

        for (subscription_id, due_at) in due {
            match self.credit_one_cycle(subscription_id, due_at, now).await {
                Ok(Some(granted)) => {
                    summary.credited += 1;
                    summary.points_granted += granted;
                }
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Cycle credit failed"
                    );
                }
            }
        }

        tracing::info!(
            due = summary.due,
            credited = summary.credited,
            skipped = summary.skipped,
            failed = summary.failed,
            points_granted = summary.points_granted,
            "Subscription cycle sweep complete"
        );

        Ok(summary)
    }

    /// One monthly grant. The conditional update is the claim: it only
    /// matches while `next_credit_at` still holds the due value read by the
    /// scan, and it advances the cadence in the same transaction as the
    /// credit.
    async fn credit_one_cycle(
        &self,
        subscription_id: Uuid,
        due_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> PointsResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let claimed: Option<(String, String, i64, String)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET next_credit_at = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'active' AND next_credit_at = $2 AND next_credit_at <= $4
            RETURNING user_id, provider_subscription_id, points_per_cycle, plan_name
            "#,
        )
        .bind(subscription_id)
        .bind(due_at)
        .bind(add_months(due_at, 1))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id, provider_subscription_id, points_per_cycle, plan_name)) = claimed
        else {
            return Ok(None);
        };

        let outcome = self
            .ledger
            .credit_in_tx(
                &mut tx,
                &CreditParams {
                    user_id: user_id.clone(),
                    kind: LedgerKind::SubscriptionCredit,
                    amount: points_per_cycle,
                    source: serde_json::json!({
                        "subscription_id": subscription_id,
                        "provider_subscription_id": provider_subscription_id,
                        "plan": plan_name,
                        "cycle_due_at": due_at.unix_timestamp(),
                    }),
                    action_id: cycle_action_id(subscription_id, due_at),
                    expires_at: self.promo_expiry(now),
                    created_by: "system:cycle_sweep".into(),
                },
            )
            .await?;

        let granted = if outcome.deduplicated {
            0
        } else {
            sqlx::query(
                "UPDATE subscriptions SET total_granted = total_granted + $2 WHERE id = $1",
            )
            .bind(subscription_id)
            .bind(points_per_cycle)
            .execute(&mut *tx)
            .await?;
            points_per_cycle
        };

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            granted = granted,
            "Monthly cycle credited"
        );

        Ok(Some(granted))
    }

    pub async fn get_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> PointsResult<Option<SubscriptionRow>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE provider_subscription_id = $1",
        )
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn bump_total_granted(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Uuid,
        amount: i64,
    ) -> PointsResult<()> {
        sqlx::query("UPDATE subscriptions SET total_granted = total_granted + $2 WHERE id = $1")
            .bind(subscription_id)
            .bind(amount)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    fn promo_expiry(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        match self.config.subscription_points_kind {
            CreditDestination::Paid => None,
            CreditDestination::Promo => {
                Some(now + Duration::days(self.config.subscription_promo_expiry_days))
            }
        }
    }
}

fn activation_action_id(provider_subscription_id: &str) -> String {
    format!("sub:{provider_subscription_id}:activate")
}

fn renewal_action_id(
    provider_subscription_id: &str,
    period_end: Option<OffsetDateTime>,
    event_id: &str,
) -> String {
    match period_end {
        Some(end) => format!(
            "sub:{provider_subscription_id}:renewal:{}",
            end.unix_timestamp()
        ),
        // No period end in the payload; the provider event id still
        // dedupes replays of this exact delivery.
        None => format!("sub:{provider_subscription_id}:renewal:evt:{event_id}"),
    }
}

fn cycle_action_id(subscription_id: Uuid, due_at: OffsetDateTime) -> String {
    format!("sub:{subscription_id}:cycle:{}", due_at.unix_timestamp())
}

/// Calendar month addition with day-of-month clamping: Jan 31 + 1 month is
/// Feb 28 (or 29), never Mar 2. Time of day is preserved.
pub(crate) fn add_months(at: OffsetDateTime, months: i32) -> OffsetDateTime {
    let date = at.date();
    let zero_based = i32::from(u8::from(date.month())) - 1 + months;
    let year = date.year() + zero_based.div_euclid(12);
    let month =
        Month::try_from((zero_based.rem_euclid(12) + 1) as u8).unwrap_or(date.month());
    let day = date.day().min(time::util::days_in_year_month(year, month));
    let new_date = Date::from_calendar_date(year, month, day).unwrap_or(date);
    at.replace_date(new_date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn add_month_clamps_jan_31_to_feb_end() {
        let jan31 = datetime!(2025-01-31 10:30:00 UTC);
        assert_eq!(add_months(jan31, 1), datetime!(2025-02-28 10:30:00 UTC));

        let leap = datetime!(2024-01-31 00:00:00 UTC);
        assert_eq!(add_months(leap, 1), datetime!(2024-02-29 00:00:00 UTC));
    }

    #[test]
    fn add_month_crosses_year_boundary() {
        let dec = datetime!(2025-12-15 08:00:00 UTC);
        assert_eq!(add_months(dec, 1), datetime!(2026-01-15 08:00:00 UTC));
    }

    #[test]
    fn add_month_clamps_31_day_to_30_day_month() {
        let mar31 = datetime!(2025-03-31 23:59:59 UTC);
        assert_eq!(add_months(mar31, 1), datetime!(2025-04-30 23:59:59 UTC));
    }

    #[test]
    fn add_many_months_stays_clamped() {
        let jan31 = datetime!(2025-01-31 12:00:00 UTC);
        assert_eq!(add_months(jan31, 13), datetime!(2026-02-28 12:00:00 UTC));
    }

    #[test]
    fn add_month_preserves_ordinary_days() {
        let mid = datetime!(2025-06-10 00:00:00 UTC);
        assert_eq!(add_months(mid, 1), datetime!(2025-07-10 00:00:00 UTC));
    }

    #[test]
    fn renewal_action_id_prefers_period_end() {
        let end = datetime!(2025-09-01 00:00:00 UTC);
        assert_eq!(
            renewal_action_id("ps_1", Some(end), "evt_9"),
            format!("sub:ps_1:renewal:{}", end.unix_timestamp())
        );
        assert_eq!(
            renewal_action_id("ps_1", None, "evt_9"),
            "sub:ps_1:renewal:evt:evt_9"
        );
    }

    #[test]
    fn cycle_action_ids_differ_per_due_month() {
        let id = Uuid::new_v4();
        let first = datetime!(2025-05-01 00:00:00 UTC);
        let a = cycle_action_id(id, first);
        let b = cycle_action_id(id, add_months(first, 1));
        assert_ne!(a, b);
    }
}
