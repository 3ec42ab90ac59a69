//! Nightly wallet-vs-ledger reconciliation.
//!
//! For each wallet, the sum of ledger paid deltas is the ground truth
//! and the wallet's paid_balance is a snapshot that must follow it.
//! Drift produces a corrective `reconcile_adjustment` entry that moves
//! the snapshot back onto the ledger, committed atomically with the
//! report row. Prior adjustments are excluded from the sum; they record
//! snapshot corrections, not balance movements, and counting them would
//! re-trigger a correction every night.
//!
//! One report per user per day. The report insert and the corrective
//! entry share a transaction, so a re-run (or a concurrent sweep) either
//! sees the finished report and skips, or loses the unique-constraint
//! race and rolls back.

use serde::Serialize;
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{PointsError, PointsResult};
use crate::ledger::LedgerStore;
use crate::types::LedgerKind;

/// Wallets scanned per page during a sweep.
const SCAN_BATCH_SIZE: i64 = 500;

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationSummary {
    pub run_date: String,
    pub checked: u64,
    pub clean: u64,
    pub adjusted: u64,
    pub skipped: u64,
    pub errors: u64,
    pub total_abs_drift: i64,
}

#[derive(Debug)]
pub enum ReconcileOutcome {
    Clean,
    Adjusted { delta: i64 },
    /// A report for this user and date already exists.
    Skipped,
}

#[derive(Clone)]
pub struct ReconciliationJob {
    ledger: LedgerStore,
}

impl ReconciliationJob {
    pub fn new(ledger: LedgerStore) -> Self {
        Self { ledger }
    }

    /// Reconcile every wallet for today (UTC).
    pub async fn run_sweep(&self) -> PointsResult<ReconciliationSummary> {
        self.run_for_date(OffsetDateTime::now_utc().date()).await
    }

    pub async fn run_for_date(&self, run_date: Date) -> PointsResult<ReconciliationSummary> {
        let mut summary = ReconciliationSummary {
            run_date: run_date.to_string(),
            checked: 0,
            clean: 0,
            adjusted: 0,
            skipped: 0,
            errors: 0,
            total_abs_drift: 0,
        };

        let mut cursor: Option<String> = None;
        loop {
            let page: Vec<(String,)> = match cursor.as_deref() {
                None => {
                    sqlx::query_as("SELECT user_id FROM wallets ORDER BY user_id LIMIT $1")
                        .bind(SCAN_BATCH_SIZE)
                        .fetch_all(self.ledger.pool())
                        .await?
                }
                Some(after) => {
                    sqlx::query_as(
                        "SELECT user_id FROM wallets WHERE user_id > $2 ORDER BY user_id LIMIT $1",
                    )
                    .bind(SCAN_BATCH_SIZE)
                    .bind(after)
                    .fetch_all(self.ledger.pool())
                    .await?
                }
            };
            if page.is_empty() {
                break;
            }

            for (user_id,) in &page {
                summary.checked += 1;
                match self.reconcile_user(user_id, run_date).await {
                    Ok(ReconcileOutcome::Clean) => summary.clean += 1,
                    Ok(ReconcileOutcome::Adjusted { delta }) => {
                        summary.adjusted += 1;
                        summary.total_abs_drift += delta.abs();
                    }
                    Ok(ReconcileOutcome::Skipped) => summary.skipped += 1,
                    Err(e) => {
                        summary.errors += 1;
                        tracing::warn!(
                            user_id = %user_id,
                            error = %e,
                            "Reconciliation failed for user, continuing sweep"
                        );
                        self.record_error_report(user_id, run_date, &e.to_string())
                            .await;
                    }
                }
            }

            cursor = page.last().map(|(u,)| u.clone());
            if (page.len() as i64) < SCAN_BATCH_SIZE {
                break;
            }
        }

        tracing::info!(
            run_date = %summary.run_date,
            checked = summary.checked,
            clean = summary.clean,
            adjusted = summary.adjusted,
            skipped = summary.skipped,
            errors = summary.errors,
            total_abs_drift = summary.total_abs_drift,
            "Reconciliation sweep complete"
        );
        Ok(summary)
    }

    /// Reconcile one wallet. Report and corrective entry commit together.
    pub async fn reconcile_user(
        &self,
        user_id: &str,
        run_date: Date,
    ) -> PointsResult<ReconcileOutcome> {
        let mut tx = self.ledger.pool().begin().await?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM reconciliation_reports WHERE user_id = $1 AND run_date = $2",
        )
        .bind(user_id)
        .bind(run_date)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Ok(ReconcileOutcome::Skipped);
        }

        let wallet: Option<(i64,)> =
            sqlx::query_as("SELECT paid_balance FROM wallets WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let wallet_before = wallet
            .map(|(p,)| p)
            .ok_or_else(|| PointsError::not_found("wallet", user_id))?;

        let (ledger_sum, ledger_count): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(paid_delta), 0)::BIGINT, COUNT(*)
            FROM ledger_entries
            WHERE user_id = $1 AND kind <> $2
            "#,
        )
        .bind(user_id)
        .bind(LedgerKind::ReconcileAdjustment.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let delta = wallet_before - ledger_sum;
        let checksum = report_checksum(user_id, ledger_sum, wallet_before, run_date);

        if delta == 0 {
            let inserted = self
                .insert_report(
                    &mut tx,
                    ReportRow {
                        user_id,
                        run_date,
                        wallet_before,
                        wallet_after: wallet_before,
                        ledger_sum,
                        delta: 0,
                        ledger_count,
                        status: "clean",
                        checksum: Some(&checksum),
                        error_message: None,
                    },
                )
                .await?;
            if !inserted {
                tx.rollback().await?;
                return Ok(ReconcileOutcome::Skipped);
            }
            tx.commit().await?;
            return Ok(ReconcileOutcome::Clean);
        }

        let amount = -delta;
        let action_id = format!("recon:{user_id}:{run_date}");
        let source = serde_json::json!({
            "job": "reconciliation",
            "run_date": run_date.to_string(),
            "wallet_before": wallet_before,
            "ledger_sum": ledger_sum,
            "delta": delta,
        });

        let applied = self
            .ledger
            .apply_adjustment_in_tx(
                &mut tx,
                user_id,
                amount,
                LedgerKind::ReconcileAdjustment,
                &source,
                &action_id,
                "system:reconciliation",
            )
            .await?;
        if applied.is_none() {
            tx.rollback().await?;
            return Ok(ReconcileOutcome::Skipped);
        }

        let wallet_after = wallet_before + amount;
        let inserted = self
            .insert_report(
                &mut tx,
                ReportRow {
                    user_id,
                    run_date,
                    wallet_before,
                    wallet_after,
                    ledger_sum,
                    delta,
                    ledger_count,
                    status: "adjusted",
                    checksum: Some(&checksum),
                    error_message: None,
                },
            )
            .await?;
        if !inserted {
            tx.rollback().await?;
            return Ok(ReconcileOutcome::Skipped);
        }

        tx.commit().await?;
        tracing::warn!(
            user_id = %user_id,
            wallet_before = wallet_before,
            wallet_after = wallet_after,
            ledger_sum = ledger_sum,
            delta = delta,
            "Wallet drift corrected"
        );
        Ok(ReconcileOutcome::Adjusted { delta })
    }

    async fn insert_report(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        row: ReportRow<'_>,
    ) -> PointsResult<bool> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO reconciliation_reports
                (user_id, run_date, wallet_before, wallet_after, ledger_sum,
                 delta, ledger_count, status, checksum, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id, run_date) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(row.user_id)
        .bind(row.run_date)
        .bind(row.wallet_before)
        .bind(row.wallet_after)
        .bind(row.ledger_sum)
        .bind(row.delta)
        .bind(row.ledger_count)
        .bind(row.status)
        .bind(row.checksum)
        .bind(row.error_message)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(inserted.is_some())
    }

    /// Best-effort error report outside the failed transaction.
    async fn record_error_report(&self, user_id: &str, run_date: Date, message: &str) {
        let write = sqlx::query(
            r#"
            INSERT INTO reconciliation_reports
                (user_id, run_date, status, error_message)
            VALUES ($1, $2, 'error', $3)
            ON CONFLICT (user_id, run_date) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(run_date)
        .bind(message)
        .execute(self.ledger.pool())
        .await;
        if let Err(e) = write {
            tracing::warn!(
                user_id = %user_id,
                error = %e,
                "Could not record reconciliation error report"
            );
        }
    }
}

struct ReportRow<'a> {
    user_id: &'a str,
    run_date: Date,
    wallet_before: i64,
    wallet_after: i64,
    ledger_sum: i64,
    delta: i64,
    ledger_count: i64,
    status: &'a str,
    checksum: Option<&'a str>,
    error_message: Option<&'a str>,
}

fn report_checksum(user_id: &str, ledger_sum: i64, wallet_before: i64, run_date: Date) -> String {
    let line = format!("{user_id}|{ledger_sum}|{wallet_before}|{run_date}");
    hex::encode(Sha256::digest(line.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn checksum_is_stable_and_input_sensitive() {
        let day = date!(2026 - 03 - 01);
        let a = report_checksum("u_1", 500, 500, day);
        let b = report_checksum("u_1", 500, 500, day);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        assert_ne!(a, report_checksum("u_2", 500, 500, day));
        assert_ne!(a, report_checksum("u_1", 501, 500, day));
        assert_ne!(a, report_checksum("u_1", 500, 499, day));
        assert_ne!(a, report_checksum("u_1", 500, 500, date!(2026 - 03 - 02)));
    }

    #[test]
    fn corrective_amount_closes_the_gap() {
        // wallet ahead of ledger: snapshot comes back down
        let (wallet, ledger) = (120i64, 100i64);
        let delta = wallet - ledger;
        assert_eq!(wallet + (-delta), ledger);

        // wallet behind ledger: snapshot catches up
        let (wallet, ledger) = (40i64, 90i64);
        let delta = wallet - ledger;
        assert_eq!(wallet + (-delta), ledger);
    }
}
