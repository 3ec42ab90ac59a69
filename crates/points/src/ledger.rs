//! Append-only points ledger and derived wallet snapshot.
//!
//! Every balance mutation happens inside a single transaction that locks the
//! user's wallet row, so concurrent writers to one user serialize while
//! different users proceed in parallel. The `(user_id, action_id)` unique
//! constraint on entries is the idempotency mechanism: a replayed action is
//! detected under the wallet lock and returns the original result.
//!
//! `wallets.paid_balance` must equal the sum of `paid_delta` over all
//! entries except `reconcile_adjustment` corrections; the reconciliation job
//! audits exactly that.

use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{PointsError, PointsResult};
use crate::types::{
    CreditOutcome, LedgerEntry, LedgerKind, SpendOutcome, SpendPreview, WalletBalance,
};

/// Bounded retry for serialization conflicts; after this the error surfaces
/// as `TransientStorage` and the delivery channel retries instead.
const TX_RETRY_ATTEMPTS: usize = 3;
/// Exponential base, so delays run 10ms, 100ms, 1s before giving up.
const TX_RETRY_BASE_MS: u64 = 10;

#[derive(Debug, Clone)]
pub struct CreditParams {
    pub user_id: String,
    pub kind: LedgerKind,
    pub amount: i64,
    pub source: JsonValue,
    pub action_id: String,
    /// Present for promo credits; the amount becomes a promo lot with this
    /// expiry instead of landing in the paid balance.
    pub expires_at: Option<OffsetDateTime>,
    pub created_by: String,
}

#[derive(Debug, Clone)]
pub struct SpendParams {
    pub user_id: String,
    pub cost: i64,
    pub action_id: String,
    /// What the points were spent on, recorded in the entry source.
    pub action: String,
    pub created_by: String,
}

#[derive(Clone)]
pub struct LedgerStore {
    pool: PgPool,
    allow_negative_balance: bool,
}

impl LedgerStore {
    pub fn new(pool: PgPool, allow_negative_balance: bool) -> Self {
        Self {
            pool,
            allow_negative_balance,
        }
    }

    /// Credit points to a user, creating the wallet on first use.
    ///
    /// Idempotent on `action_id`: a replay returns the original entry with
    /// `deduplicated = true` and no balance change.
    pub async fn credit(&self, params: CreditParams) -> PointsResult<CreditOutcome> {
        if params.amount <= 0 {
            return Err(PointsError::InvalidAmount(format!(
                "credit amount must be positive, got {}",
                params.amount
            )));
        }

        let strategy = ExponentialBackoff::from_millis(TX_RETRY_BASE_MS)
            .map(jitter)
            .take(TX_RETRY_ATTEMPTS);
        RetryIf::spawn(strategy, || self.credit_once(&params), is_transient).await
    }

    async fn credit_once(&self, params: &CreditParams) -> PointsResult<CreditOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = self.credit_in_tx(&mut tx, params).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Credit inside a caller-owned transaction, so e.g. "mark webhook
    /// processed" and "apply credit" commit together or not at all.
    pub async fn credit_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        params: &CreditParams,
    ) -> PointsResult<CreditOutcome> {
        if params.amount <= 0 {
            return Err(PointsError::InvalidAmount(format!(
                "credit amount must be positive, got {}",
                params.amount
            )));
        }

        ensure_wallet(tx, &params.user_id).await?;
        let paid_before = lock_wallet(tx, &params.user_id)
            .await?
            .ok_or_else(|| PointsError::not_found("wallet", &params.user_id))?;

        if let Some(prior) = find_entry(tx, &params.user_id, &params.action_id).await? {
            tracing::info!(
                user_id = %params.user_id,
                action_id = %params.action_id,
                ledger_id = %prior.id,
                "Duplicate credit action - returning original result"
            );
            return Ok(CreditOutcome {
                ledger_id: prior.id,
                new_balance: prior.balance_after,
                deduplicated: true,
            });
        }

        let (paid_delta, promo_delta, lot_id) = match params.expires_at {
            Some(expires_at) => {
                let lot_id: (Uuid,) = sqlx::query_as(
                    r#"
                    INSERT INTO promo_lots (user_id, initial_points, remaining_points, expires_at, granted_by)
                    VALUES ($1, $2, $2, $3, $4)
                    RETURNING id
                    "#,
                )
                .bind(&params.user_id)
                .bind(params.amount)
                .bind(expires_at)
                .bind(&params.created_by)
                .fetch_one(&mut **tx)
                .await?;
                (0i64, params.amount, Some(lot_id.0))
            }
            None => (params.amount, 0i64, None),
        };

        let promo_after = promo_lot_sum(tx, &params.user_id).await?;
        let paid_after = paid_before + paid_delta;
        sqlx::query(
            r#"
            UPDATE wallets
            SET paid_balance = $2, promo_balance = $3, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(&params.user_id)
        .bind(paid_after)
        .bind(promo_after)
        .execute(&mut **tx)
        .await?;

        let new_balance = paid_after + promo_after;
        let mut source = params.source.clone();
        if let (Some(lot), Some(obj)) = (lot_id, source.as_object_mut()) {
            obj.insert("promo_lot_id".to_string(), JsonValue::String(lot.to_string()));
        }

        let (ledger_id,) = insert_entry(
            tx,
            &EntryRow {
                user_id: &params.user_id,
                amount: params.amount,
                paid_delta,
                promo_delta,
                balance_after: new_balance,
                kind: params.kind,
                source: &source,
                action_id: &params.action_id,
                created_by: &params.created_by,
            },
        )
        .await?;

        tracing::info!(
            user_id = %params.user_id,
            amount = params.amount,
            kind = %params.kind,
            ledger_id = %ledger_id,
            new_balance = new_balance,
            "Credit applied"
        );

        Ok(CreditOutcome {
            ledger_id,
            new_balance,
            deduplicated: false,
        })
    }

    /// Spend points, consuming promo lots soonest-expiry-first before paid
    /// balance. Rejects with `InsufficientBalance` unless negative balances
    /// are enabled, in which case the paid balance may go below zero.
    pub async fn spend(&self, params: SpendParams) -> PointsResult<SpendOutcome> {
        if params.cost <= 0 {
            return Err(PointsError::InvalidAmount(format!(
                "spend cost must be positive, got {}",
                params.cost
            )));
        }

        let strategy = ExponentialBackoff::from_millis(TX_RETRY_BASE_MS)
            .map(jitter)
            .take(TX_RETRY_ATTEMPTS);
        RetryIf::spawn(strategy, || self.spend_once(&params), is_transient).await
    }

    async fn spend_once(&self, params: &SpendParams) -> PointsResult<SpendOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = self.spend_in_tx(&mut tx, params).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn spend_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        params: &SpendParams,
    ) -> PointsResult<SpendOutcome> {
        if params.cost <= 0 {
            return Err(PointsError::InvalidAmount(format!(
                "spend cost must be positive, got {}",
                params.cost
            )));
        }

        let Some(paid_before) = lock_wallet(tx, &params.user_id).await? else {
            return Err(PointsError::InsufficientBalance {
                needed: params.cost,
                available: 0,
            });
        };

        if let Some(prior) = find_entry(tx, &params.user_id, &params.action_id).await? {
            return Ok(SpendOutcome {
                ledger_id: prior.id,
                new_balance: prior.balance_after,
                promo_spent: -prior.promo_delta,
                paid_spent: -prior.paid_delta,
                deduplicated: true,
            });
        }

        let lots = active_lots(tx, &params.user_id).await?;
        let plan = plan_spend(params.cost, &lots, paid_before, self.allow_negative_balance)?;

        for (lot_id, draw) in &plan.draws {
            sqlx::query(
                "UPDATE promo_lots SET remaining_points = remaining_points - $2 WHERE id = $1",
            )
            .bind(lot_id)
            .bind(draw)
            .execute(&mut **tx)
            .await?;
        }

        let promo_after = promo_lot_sum(tx, &params.user_id).await?;
        let paid_after = paid_before - plan.paid_spent;
        sqlx::query(
            r#"
            UPDATE wallets
            SET paid_balance = $2, promo_balance = $3, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(&params.user_id)
        .bind(paid_after)
        .bind(promo_after)
        .execute(&mut **tx)
        .await?;

        let new_balance = paid_after + promo_after;
        let source = serde_json::json!({ "action": params.action });
        let (ledger_id,) = insert_entry(
            tx,
            &EntryRow {
                user_id: &params.user_id,
                amount: -params.cost,
                paid_delta: -plan.paid_spent,
                promo_delta: -plan.promo_spent,
                balance_after: new_balance,
                kind: LedgerKind::Spend,
                source: &source,
                action_id: &params.action_id,
                created_by: &params.created_by,
            },
        )
        .await?;

        tracing::info!(
            user_id = %params.user_id,
            cost = params.cost,
            promo_spent = plan.promo_spent,
            paid_spent = plan.paid_spent,
            ledger_id = %ledger_id,
            "Spend applied"
        );

        Ok(SpendOutcome {
            ledger_id,
            new_balance,
            promo_spent: plan.promo_spent,
            paid_spent: plan.paid_spent,
            deduplicated: false,
        })
    }

    /// Dry-run a spend without touching anything.
    pub async fn preview_spend(&self, user_id: &str, cost: i64) -> PointsResult<SpendPreview> {
        if cost <= 0 {
            return Err(PointsError::InvalidAmount(format!(
                "spend cost must be positive, got {cost}"
            )));
        }

        let paid: Option<(i64,)> =
            sqlx::query_as("SELECT paid_balance FROM wallets WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        let paid = paid.map(|(p,)| p).unwrap_or(0);

        let lots: Vec<LotView> = sqlx::query_as(
            r#"
            SELECT id, remaining_points, expires_at
            FROM promo_lots
            WHERE user_id = $1 AND remaining_points > 0 AND expires_at > NOW()
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let promo_available: i64 = lots.iter().map(|l| l.remaining_points).sum();
        let balance_before = paid + promo_available;

        match plan_spend(cost, &lots, paid, self.allow_negative_balance) {
            Ok(plan) => Ok(SpendPreview {
                balance_before,
                balance_after: balance_before - cost,
                promo_spent: plan.promo_spent,
                paid_spent: plan.paid_spent,
                promo_available,
                paid_available: paid,
                sufficient: true,
            }),
            Err(PointsError::InsufficientBalance { .. }) => Ok(SpendPreview {
                balance_before,
                balance_after: balance_before,
                promo_spent: 0,
                paid_spent: 0,
                promo_available,
                paid_available: paid,
                sufficient: false,
            }),
            Err(e) => Err(e),
        }
    }

    /// Live balance view. Unknown users read as zero; the wallet row is
    /// only created by the first credit.
    pub async fn get_wallet_balance(&self, user_id: &str) -> PointsResult<WalletBalance> {
        let paid: Option<(i64,)> =
            sqlx::query_as("SELECT paid_balance FROM wallets WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        let paid_balance = paid.map(|(p,)| p).unwrap_or(0);

        let (promo_balance,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(remaining_points), 0)::BIGINT
            FROM promo_lots
            WHERE user_id = $1 AND remaining_points > 0 AND expires_at > NOW()
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(WalletBalance {
            user_id: user_id.to_string(),
            paid_balance,
            promo_balance,
            total: paid_balance + promo_balance,
        })
    }

    /// Newest-first history page. `start_after` is the id of the last entry
    /// of the previous page.
    pub async fn get_ledger_entries(
        &self,
        user_id: &str,
        limit: i64,
        start_after: Option<Uuid>,
    ) -> PointsResult<Vec<LedgerEntry>> {
        let limit = limit.clamp(1, 100);

        let entries = match start_after {
            None => {
                sqlx::query_as::<_, LedgerEntry>(
                    r#"
                    SELECT * FROM ledger_entries
                    WHERE user_id = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(user_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            Some(cursor) => {
                let anchor: Option<(OffsetDateTime,)> = sqlx::query_as(
                    "SELECT created_at FROM ledger_entries WHERE user_id = $1 AND id = $2",
                )
                .bind(user_id)
                .bind(cursor)
                .fetch_optional(&self.pool)
                .await?;
                let (anchor_time,) =
                    anchor.ok_or_else(|| PointsError::not_found_uuid("ledger entry", cursor))?;

                sqlx::query_as::<_, LedgerEntry>(
                    r#"
                    SELECT * FROM ledger_entries
                    WHERE user_id = $1 AND (created_at, id) < ($2, $3)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4
                    "#,
                )
                .bind(user_id)
                .bind(anchor_time)
                .bind(cursor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(entries)
    }

    /// Reverse a prior credit entry (refund, chargeback, or admin backout).
    ///
    /// The reversal negates the original deltas. For the promo part only the
    /// unspent remainder of the original lot is clawed back. Idempotent per
    /// original entry.
    pub async fn create_reversal_entry(
        &self,
        user_id: &str,
        original_ledger_id: Uuid,
        kind: LedgerKind,
        created_by: &str,
        reason: &str,
    ) -> PointsResult<LedgerEntry> {
        if !matches!(
            kind,
            LedgerKind::Refund | LedgerKind::Chargeback | LedgerKind::AdminAdjustment
        ) {
            return Err(PointsError::InvalidPayload(format!(
                "kind '{kind}' cannot be used for reversals"
            )));
        }

        let mut tx = self.pool.begin().await?;

        let paid_before = lock_wallet(&mut tx, user_id)
            .await?
            .ok_or_else(|| PointsError::not_found("wallet", user_id))?;

        let original = sqlx::query_as::<_, LedgerEntry>(
            "SELECT * FROM ledger_entries WHERE user_id = $1 AND id = $2",
        )
        .bind(user_id)
        .bind(original_ledger_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| PointsError::not_found_uuid("ledger entry", original_ledger_id))?;

        if original.amount <= 0 {
            return Err(PointsError::InvalidPayload(
                "only credit entries can be reversed".into(),
            ));
        }

        let action_id = format!("reversal:{original_ledger_id}");
        if let Some(prior) = find_entry(&mut tx, user_id, &action_id).await? {
            tx.commit().await?;
            return Ok(prior);
        }

        let paid_part = original.paid_delta;
        if paid_part > 0 && paid_before < paid_part && !self.allow_negative_balance {
            return Err(PointsError::InsufficientBalance {
                needed: paid_part,
                available: paid_before,
            });
        }

        // Claw back whatever is left of the original lot, if any.
        let mut promo_clawed = 0i64;
        if original.promo_delta > 0 {
            if let Some(lot_id) = original
                .source
                .get("promo_lot_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                let lot: Option<(i64,)> = sqlx::query_as(
                    "SELECT remaining_points FROM promo_lots WHERE id = $1 FOR UPDATE",
                )
                .bind(lot_id)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some((remaining,)) = lot {
                    promo_clawed = remaining.min(original.promo_delta).max(0);
                    if promo_clawed > 0 {
                        sqlx::query(
                            "UPDATE promo_lots SET remaining_points = remaining_points - $2 WHERE id = $1",
                        )
                        .bind(lot_id)
                        .bind(promo_clawed)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
        }

        let promo_after = promo_lot_sum(&mut tx, user_id).await?;
        let paid_after = paid_before - paid_part;
        sqlx::query(
            r#"
            UPDATE wallets
            SET paid_balance = $2, promo_balance = $3, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(paid_after)
        .bind(promo_after)
        .execute(&mut *tx)
        .await?;

        let amount = -(paid_part + promo_clawed);
        let new_balance = paid_after + promo_after;
        let source = serde_json::json!({
            "reversal_of": original.id,
            "reason": reason,
        });
        let (ledger_id,) = insert_entry(
            &mut tx,
            &EntryRow {
                user_id,
                amount,
                paid_delta: -paid_part,
                promo_delta: -promo_clawed,
                balance_after: new_balance,
                kind,
                source: &source,
                action_id: &action_id,
                created_by,
            },
        )
        .await?;

        let entry = sqlx::query_as::<_, LedgerEntry>(
            "SELECT * FROM ledger_entries WHERE user_id = $1 AND id = $2",
        )
        .bind(user_id)
        .bind(ledger_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            original = %original_ledger_id,
            reversal = %ledger_id,
            amount = amount,
            kind = %kind,
            "Reversal entry created"
        );

        Ok(entry)
    }

    /// Signed paid-balance correction used by reconciliation. Bypasses the
    /// negative-balance policy; the ledger is ground truth and the snapshot
    /// must follow it.
    pub(crate) async fn apply_adjustment_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: &str,
        amount: i64,
        kind: LedgerKind,
        source: &JsonValue,
        action_id: &str,
        created_by: &str,
    ) -> PointsResult<Option<Uuid>> {
        ensure_wallet(tx, user_id).await?;
        let paid_before = lock_wallet(tx, user_id)
            .await?
            .ok_or_else(|| PointsError::not_found("wallet", user_id))?;

        if find_entry(tx, user_id, action_id).await?.is_some() {
            return Ok(None);
        }

        let promo_after = promo_lot_sum(tx, user_id).await?;
        let paid_after = paid_before + amount;
        sqlx::query(
            r#"
            UPDATE wallets
            SET paid_balance = $2, promo_balance = $3, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(paid_after)
        .bind(promo_after)
        .execute(&mut **tx)
        .await?;

        let (ledger_id,) = insert_entry(
            tx,
            &EntryRow {
                user_id,
                amount,
                paid_delta: amount,
                promo_delta: 0,
                balance_after: paid_after + promo_after,
                kind,
                source,
                action_id,
                created_by,
            },
        )
        .await?;

        Ok(Some(ledger_id))
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_transient(e: &PointsError) -> bool {
    matches!(e, PointsError::TransientStorage(_))
}

async fn ensure_wallet(tx: &mut Transaction<'_, Postgres>, user_id: &str) -> PointsResult<()> {
    sqlx::query("INSERT INTO wallets (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Lock the wallet row for this transaction, returning the paid balance.
/// This is the per-user serialization point for all mutations.
async fn lock_wallet(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
) -> PointsResult<Option<i64>> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT paid_balance FROM wallets WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(row.map(|(p,)| p))
}

async fn find_entry(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    action_id: &str,
) -> PointsResult<Option<LedgerEntry>> {
    let entry = sqlx::query_as::<_, LedgerEntry>(
        "SELECT * FROM ledger_entries WHERE user_id = $1 AND action_id = $2",
    )
    .bind(user_id)
    .bind(action_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(entry)
}

async fn promo_lot_sum(tx: &mut Transaction<'_, Postgres>, user_id: &str) -> PointsResult<i64> {
    let (sum,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(remaining_points), 0)::BIGINT
        FROM promo_lots
        WHERE user_id = $1 AND remaining_points > 0 AND expires_at > NOW()
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(sum)
}

struct EntryRow<'a> {
    user_id: &'a str,
    amount: i64,
    paid_delta: i64,
    promo_delta: i64,
    balance_after: i64,
    kind: LedgerKind,
    source: &'a JsonValue,
    action_id: &'a str,
    created_by: &'a str,
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    row: &EntryRow<'_>,
) -> PointsResult<(Uuid,)> {
    let id: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO ledger_entries
            (user_id, amount, paid_delta, promo_delta, balance_after, kind, source, action_id, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        "#,
    )
    .bind(row.user_id)
    .bind(row.amount)
    .bind(row.paid_delta)
    .bind(row.promo_delta)
    .bind(row.balance_after)
    .bind(row.kind.as_str())
    .bind(row.source)
    .bind(row.action_id)
    .bind(row.created_by)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

/// A promo lot as seen by the spend planner.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct LotView {
    pub id: Uuid,
    pub remaining_points: i64,
    pub expires_at: OffsetDateTime,
}

async fn active_lots(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
) -> PointsResult<Vec<LotView>> {
    let lots = sqlx::query_as::<_, LotView>(
        r#"
        SELECT id, remaining_points, expires_at
        FROM promo_lots
        WHERE user_id = $1 AND remaining_points > 0 AND expires_at > NOW()
        ORDER BY expires_at ASC, id ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(lots)
}

#[derive(Debug, Clone)]
pub(crate) struct SpendPlan {
    /// (lot id, points to draw), in drain order.
    pub draws: Vec<(Uuid, i64)>,
    pub promo_spent: i64,
    pub paid_spent: i64,
}

/// Decide how a spend splits across promo lots and paid balance.
///
/// Lots drain soonest-expiry-first; the remainder comes from paid balance.
/// The ordering is user-visible in the wallet preview and must not change.
pub(crate) fn plan_spend(
    cost: i64,
    lots: &[LotView],
    paid_balance: i64,
    allow_negative: bool,
) -> PointsResult<SpendPlan> {
    let mut ordered: Vec<&LotView> = lots.iter().collect();
    ordered.sort_by(|a, b| {
        a.expires_at
            .cmp(&b.expires_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut remaining = cost;
    let mut draws = Vec::new();
    for lot in ordered {
        if remaining == 0 {
            break;
        }
        let draw = lot.remaining_points.min(remaining);
        if draw > 0 {
            draws.push((lot.id, draw));
            remaining -= draw;
        }
    }

    let promo_spent = cost - remaining;
    let paid_spent = remaining;

    if paid_spent > paid_balance && !allow_negative {
        let promo_total: i64 = lots.iter().map(|l| l.remaining_points).sum();
        return Err(PointsError::InsufficientBalance {
            needed: cost,
            available: promo_total + paid_balance,
        });
    }

    Ok(SpendPlan {
        draws,
        promo_spent,
        paid_spent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn lot(remaining: i64, expires_in_days: i64) -> LotView {
        LotView {
            id: Uuid::new_v4(),
            remaining_points: remaining,
            expires_at: OffsetDateTime::now_utc() + Duration::days(expires_in_days),
        }
    }

    #[test]
    fn spend_drains_soonest_expiry_first() {
        let lot_a = lot(20, 3);
        let lot_b = lot(30, 10);
        // Deliberately out of order; the planner must sort by expiry.
        let lots = vec![lot_b.clone(), lot_a.clone()];

        let plan = plan_spend(25, &lots, 100, false).unwrap();

        assert_eq!(plan.draws.len(), 2);
        assert_eq!(plan.draws[0], (lot_a.id, 20));
        assert_eq!(plan.draws[1], (lot_b.id, 5));
        assert_eq!(plan.promo_spent, 25);
        assert_eq!(plan.paid_spent, 0);
    }

    #[test]
    fn spend_overflows_to_paid_after_promo() {
        let lots = vec![lot(10, 5)];
        let plan = plan_spend(45, &lots, 100, false).unwrap();
        assert_eq!(plan.promo_spent, 10);
        assert_eq!(plan.paid_spent, 35);
    }

    #[test]
    fn spend_with_no_lots_uses_paid_only() {
        let plan = plan_spend(30, &[], 50, false).unwrap();
        assert!(plan.draws.is_empty());
        assert_eq!(plan.promo_spent, 0);
        assert_eq!(plan.paid_spent, 30);
    }

    #[test]
    fn insufficient_balance_reports_available() {
        let lots = vec![lot(10, 5)];
        let err = plan_spend(100, &lots, 20, false).unwrap_err();
        match err {
            PointsError::InsufficientBalance { needed, available } => {
                assert_eq!(needed, 100);
                assert_eq!(available, 30);
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }
    }

    #[test]
    fn negative_balance_flag_permits_overdraw() {
        let plan = plan_spend(100, &[], 20, true).unwrap();
        assert_eq!(plan.paid_spent, 100);
        // Caller applies 20 - 100 = -80 to the paid balance.
    }

    #[test]
    fn equal_expiry_lots_drain_in_stable_order() {
        let now = OffsetDateTime::now_utc() + Duration::days(7);
        let mut a = lot(10, 0);
        a.expires_at = now;
        let mut b = lot(10, 0);
        b.expires_at = now;

        let plan = plan_spend(15, &[a.clone(), b.clone()], 0, false).unwrap();
        let expected_first = if a.id < b.id { a.id } else { b.id };
        assert_eq!(plan.draws[0].0, expected_first);
        assert_eq!(plan.draws[0].1, 10);
        assert_eq!(plan.draws[1].1, 5);
    }

    #[test]
    fn exact_promo_cover_leaves_paid_untouched() {
        let lots = vec![lot(25, 2)];
        let plan = plan_spend(25, &lots, 0, false).unwrap();
        assert_eq!(plan.promo_spent, 25);
        assert_eq!(plan.paid_spent, 0);
    }
}
