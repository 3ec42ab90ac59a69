//! Velocity rules gating credits before they post.
//!
//! Each rule contributes a score and a human-readable reason; the summed
//! score at or above the hold threshold turns the credit into an open hold
//! instead of a ledger entry. A hold is a business outcome, not an error:
//! the event stays open until an operator resolves it to `posted` (the
//! credit applies with its original action id) or `reversed` (it never
//! applies).
//!
//! Every evaluation writes a `risk_events` row, including clean passes. The
//! posted rows are what the shared-customer rule looks back over.

use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use qalam_shared::{VelocityLimits, VelocityStore};

use crate::error::{PointsError, PointsResult};
use crate::ledger::{CreditParams, LedgerStore};
use crate::types::{CreditOutcome, LedgerKind};

const SCORE_HOURLY_VELOCITY: i32 = 60;
const SCORE_DAILY_VELOCITY: i32 = 60;
const SCORE_PROMO_DAILY: i32 = 50;
const SCORE_SHARED_CUSTOMER: i32 = 55;
const SCORE_NEW_ACCOUNT: i32 = 50;
const SCORE_IP_VELOCITY: i32 = 50;

const SHARED_CUSTOMER_LOOKBACK_DAYS: i64 = 30;

/// A credit waiting on the velocity gate. Carries everything needed to
/// apply it later if it gets held and then resolved to posted.
#[derive(Debug, Clone)]
pub struct CreditProposal {
    pub user_id: String,
    pub amount: i64,
    pub kind: LedgerKind,
    pub action_id: String,
    pub source: JsonValue,
    pub expires_at: Option<OffsetDateTime>,
    pub provider_customer_id: Option<String>,
    pub ip: Option<String>,
    pub account_created_at: Option<OffsetDateTime>,
    pub created_by: String,
}

impl CreditProposal {
    fn credit_params(&self) -> CreditParams {
        CreditParams {
            user_id: self.user_id.clone(),
            kind: self.kind,
            amount: self.amount,
            source: self.source.clone(),
            action_id: self.action_id.clone(),
            expires_at: self.expires_at,
            created_by: self.created_by.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskResolution {
    Posted,
    Reversed,
}

impl RiskResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskResolution::Posted => "posted",
            RiskResolution::Reversed => "reversed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "posted" => Some(RiskResolution::Posted),
            "reversed" => Some(RiskResolution::Reversed),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum GateOutcome {
    Posted(CreditOutcome),
    Held {
        risk_event_id: Uuid,
        score: i32,
        reasons: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RiskEvent {
    pub id: Uuid,
    pub user_id: String,
    pub amount: i64,
    pub kind: String,
    pub action_id: Option<String>,
    pub source: JsonValue,
    pub risk_score: i32,
    pub risk_reasons: Vec<String>,
    pub decision: String,
    pub provider_customer_id: Option<String>,
    pub ip: Option<String>,
    pub account_age_minutes: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub credit_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub event: RiskEvent,
    /// Set when the resolution applied the held credit.
    pub credit: Option<CreditOutcome>,
}

/// Rolling-window readings gathered before evaluation. All sums exclude the
/// proposed amount; the rules add it where the rule text says "including".
#[derive(Debug, Clone, Default)]
pub(crate) struct WindowSnapshot {
    pub hourly_sum: i64,
    pub daily_sum: i64,
    pub daily_promo_count: i64,
    pub ip_hourly_sum: i64,
    /// Distinct accounts seen with this provider customer id in the
    /// lookback window, counting the proposing account.
    pub shared_customer_users: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct Evaluation {
    pub score: i32,
    pub reasons: Vec<String>,
}

pub(crate) fn evaluate(
    proposal: &CreditProposal,
    snap: &WindowSnapshot,
    limits: &VelocityLimits,
    now: OffsetDateTime,
) -> Evaluation {
    let mut score = 0i32;
    let mut reasons = Vec::new();

    let hourly_total = snap.hourly_sum + proposal.amount;
    if hourly_total > limits.hourly_points {
        score += SCORE_HOURLY_VELOCITY;
        reasons.push(format!(
            "hourly credit sum {hourly_total} exceeds {}/hour cap",
            limits.hourly_points
        ));
    }

    let daily_total = snap.daily_sum + proposal.amount;
    if daily_total > limits.daily_points {
        score += SCORE_DAILY_VELOCITY;
        reasons.push(format!(
            "daily credit sum {daily_total} exceeds {}/day cap",
            limits.daily_points
        ));
    }

    if proposal.kind.is_promo() && snap.daily_promo_count >= limits.daily_promo_redemptions {
        score += SCORE_PROMO_DAILY;
        reasons.push(format!(
            "{} promo redemptions in 24h reaches {}/day cap",
            snap.daily_promo_count, limits.daily_promo_redemptions
        ));
    }

    if snap.shared_customer_users > limits.shared_customer_max_users {
        score += SCORE_SHARED_CUSTOMER;
        reasons.push(format!(
            "provider customer shared by {} accounts in {}d (max {})",
            snap.shared_customer_users, SHARED_CUSTOMER_LOOKBACK_DAYS, limits.shared_customer_max_users
        ));
    }

    if let Some(created_at) = proposal.account_created_at {
        let age_minutes = (now - created_at).whole_minutes();
        if age_minutes < limits.new_account_age_minutes
            && hourly_total > limits.new_account_hourly_points
        {
            score += SCORE_NEW_ACCOUNT;
            reasons.push(format!(
                "account {age_minutes}min old credited {hourly_total} points in the last hour (limit {})",
                limits.new_account_hourly_points
            ));
        }
    }

    let ip_total = snap.ip_hourly_sum + proposal.amount;
    if proposal.ip.is_some() && ip_total > limits.ip_hourly_points {
        score += SCORE_IP_VELOCITY;
        reasons.push(format!(
            "ip credit sum {ip_total} exceeds {}/hour cap",
            limits.ip_hourly_points
        ));
    }

    Evaluation { score, reasons }
}

fn credit_key(user_id: &str) -> String {
    format!("credit:{user_id}")
}

fn promo_key(user_id: &str) -> String {
    format!("promo:{user_id}")
}

fn ip_key(ip: &str) -> String {
    format!("ip:{ip}")
}

#[derive(Clone)]
pub struct RiskEngine {
    pool: PgPool,
    ledger: LedgerStore,
    velocity: VelocityStore,
    limits: VelocityLimits,
    enabled: bool,
}

impl RiskEngine {
    pub fn new(
        pool: PgPool,
        ledger: LedgerStore,
        velocity: VelocityStore,
        limits: VelocityLimits,
        enabled: bool,
    ) -> Self {
        Self {
            pool,
            ledger,
            velocity,
            limits,
            enabled,
        }
    }

    /// Run the velocity gate and, on a pass, apply the credit inside the
    /// caller's transaction. Disabled engines pass everything through.
    pub async fn gate_credit_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        proposal: &CreditProposal,
    ) -> PointsResult<GateOutcome> {
        if !self.enabled {
            let outcome = self.ledger.credit_in_tx(tx, &proposal.credit_params()).await?;
            if !outcome.deduplicated {
                self.note_posted(
                    &proposal.user_id,
                    proposal.amount,
                    proposal.kind,
                    proposal.ip.as_deref(),
                )
                .await;
            }
            return Ok(GateOutcome::Posted(outcome));
        }

        let snap = self.snapshot(proposal).await?;
        let now = OffsetDateTime::now_utc();
        let eval = evaluate(proposal, &snap, &self.limits, now);
        let age_minutes = proposal
            .account_created_at
            .map(|created| (now - created).whole_minutes());

        if eval.score >= self.limits.hold_threshold as i32 {
            let risk_event_id =
                insert_risk_event(tx, proposal, &eval, "hold", age_minutes).await?;
            tracing::warn!(
                user_id = %proposal.user_id,
                amount = proposal.amount,
                score = eval.score,
                reasons = ?eval.reasons,
                risk_event_id = %risk_event_id,
                "Credit held for manual review"
            );
            return Ok(GateOutcome::Held {
                risk_event_id,
                score: eval.score,
                reasons: eval.reasons,
            });
        }

        let outcome = self.ledger.credit_in_tx(tx, &proposal.credit_params()).await?;
        if !outcome.deduplicated {
            insert_risk_event(tx, proposal, &eval, "posted", age_minutes).await?;
            self.note_posted(
                &proposal.user_id,
                proposal.amount,
                proposal.kind,
                proposal.ip.as_deref(),
            )
            .await;
        }
        Ok(GateOutcome::Posted(outcome))
    }

    /// Close an open hold. `Posted` applies the held credit with its
    /// original action id, so a concurrent webhook replay cannot double it.
    pub async fn resolve(
        &self,
        risk_event_id: Uuid,
        resolution: RiskResolution,
        resolved_by: &str,
    ) -> PointsResult<ResolutionOutcome> {
        let mut tx = self.pool.begin().await?;

        let event = sqlx::query_as::<_, RiskEvent>(
            "SELECT * FROM risk_events WHERE id = $1 FOR UPDATE",
        )
        .bind(risk_event_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| PointsError::not_found_uuid("risk event", risk_event_id))?;

        if event.decision != "hold" || event.resolved_at.is_some() {
            return Err(PointsError::InvalidPayload(format!(
                "risk event {risk_event_id} is not an open hold"
            )));
        }

        let kind = LedgerKind::parse(&event.kind).ok_or_else(|| {
            PointsError::InvalidPayload(format!(
                "risk event {risk_event_id} has unknown kind '{}'",
                event.kind
            ))
        })?;

        let credit = match resolution {
            RiskResolution::Posted => {
                let action_id = event.action_id.clone().ok_or_else(|| {
                    PointsError::InvalidPayload(format!(
                        "risk event {risk_event_id} has no action id to post"
                    ))
                })?;
                let params = CreditParams {
                    user_id: event.user_id.clone(),
                    kind,
                    amount: event.amount,
                    source: event.source.clone(),
                    action_id,
                    expires_at: event.credit_expires_at,
                    created_by: resolved_by.to_string(),
                };
                Some(self.ledger.credit_in_tx(&mut tx, &params).await?)
            }
            RiskResolution::Reversed => None,
        };

        let updated = sqlx::query_as::<_, RiskEvent>(
            r#"
            UPDATE risk_events
            SET decision = $2, resolved_at = NOW(), resolved_by = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(risk_event_id)
        .bind(resolution.as_str())
        .bind(resolved_by)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(outcome) = &credit {
            if !outcome.deduplicated {
                self.note_posted(&updated.user_id, updated.amount, kind, updated.ip.as_deref())
                    .await;
            }
        }

        tracing::info!(
            risk_event_id = %risk_event_id,
            user_id = %updated.user_id,
            resolution = resolution.as_str(),
            resolved_by = %resolved_by,
            "Risk hold resolved"
        );

        Ok(ResolutionOutcome {
            event: updated,
            credit,
        })
    }

    pub async fn list_open_holds(&self, limit: i64) -> PointsResult<Vec<RiskEvent>> {
        let events = sqlx::query_as::<_, RiskEvent>(
            r#"
            SELECT * FROM risk_events
            WHERE decision = 'hold' AND resolved_at IS NULL
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn snapshot(&self, proposal: &CreditProposal) -> PointsResult<WindowSnapshot> {
        let user_key = credit_key(&proposal.user_id);
        let hourly_sum = self.sum_or_zero(&user_key, Duration::hours(1)).await;
        let daily_sum = self.sum_or_zero(&user_key, Duration::hours(24)).await;

        let daily_promo_count = if proposal.kind.is_promo() {
            self.count_or_zero(&promo_key(&proposal.user_id), Duration::hours(24))
                .await
        } else {
            0
        };

        let ip_hourly_sum = match proposal.ip.as_deref() {
            Some(ip) => self.sum_or_zero(&ip_key(ip), Duration::hours(1)).await,
            None => 0,
        };

        let shared_customer_users = match proposal.provider_customer_id.as_deref() {
            Some(customer_id) => {
                let (others,): (i64,) = sqlx::query_as(
                    r#"
                    SELECT COUNT(DISTINCT user_id)::BIGINT
                    FROM risk_events
                    WHERE provider_customer_id = $1
                      AND user_id <> $2
                      AND created_at > NOW() - INTERVAL '30 days'
                    "#,
                )
                .bind(customer_id)
                .bind(&proposal.user_id)
                .fetch_one(&self.pool)
                .await?;
                others + 1
            }
            None => 0,
        };

        Ok(WindowSnapshot {
            hourly_sum,
            daily_sum,
            daily_promo_count,
            ip_hourly_sum,
            shared_customer_users,
        })
    }

    // Velocity reads fail open: a down Redis must not block purchases.
    async fn sum_or_zero(&self, key: &str, window: Duration) -> i64 {
        match self.velocity.sum_since(key, window).await {
            Ok(sum) => sum,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Velocity sum read failed - treating as zero");
                0
            }
        }
    }

    async fn count_or_zero(&self, key: &str, window: Duration) -> i64 {
        match self.velocity.count_since(key, window).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Velocity count read failed - treating as zero");
                0
            }
        }
    }

    /// Feed a posted credit into the rolling windows. Write failures warn
    /// and drop the observation.
    async fn note_posted(&self, user_id: &str, amount: i64, kind: LedgerKind, ip: Option<&str>) {
        let now = OffsetDateTime::now_utc();
        let user_key = credit_key(user_id);
        if let Err(e) = self.velocity.record(&user_key, amount, now).await {
            tracing::warn!(key = %user_key, error = %e, "Velocity record failed");
        }
        if kind.is_promo() {
            let key = promo_key(user_id);
            if let Err(e) = self.velocity.record(&key, 1, now).await {
                tracing::warn!(key = %key, error = %e, "Velocity record failed");
            }
        }
        if let Some(ip) = ip {
            let key = ip_key(ip);
            if let Err(e) = self.velocity.record(&key, amount, now).await {
                tracing::warn!(key = %key, error = %e, "Velocity record failed");
            }
        }
    }
}

async fn insert_risk_event(
    tx: &mut Transaction<'_, Postgres>,
    proposal: &CreditProposal,
    eval: &Evaluation,
    decision: &str,
    account_age_minutes: Option<i64>,
) -> PointsResult<Uuid> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO risk_events
            (user_id, amount, kind, action_id, source, risk_score, risk_reasons,
             decision, provider_customer_id, ip, account_age_minutes, credit_expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING id
        "#,
    )
    .bind(&proposal.user_id)
    .bind(proposal.amount)
    .bind(proposal.kind.as_str())
    .bind(&proposal.action_id)
    .bind(&proposal.source)
    .bind(eval.score)
    .bind(&eval.reasons)
    .bind(decision)
    .bind(&proposal.provider_customer_id)
    .bind(&proposal.ip)
    .bind(account_age_minutes)
    .bind(proposal.expires_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(amount: i64, kind: LedgerKind) -> CreditProposal {
        CreditProposal {
            user_id: "user_1".into(),
            amount,
            kind,
            action_id: "order:ord_1:prod_1".into(),
            source: serde_json::json!({}),
            expires_at: None,
            provider_customer_id: None,
            ip: None,
            account_created_at: None,
            created_by: "system:webhook".into(),
        }
    }

    fn limits() -> VelocityLimits {
        VelocityLimits::default()
    }

    #[test]
    fn clean_proposal_scores_zero() {
        let eval = evaluate(
            &proposal(50, LedgerKind::Purchase),
            &WindowSnapshot::default(),
            &limits(),
            OffsetDateTime::now_utc(),
        );
        assert_eq!(eval.score, 0);
        assert!(eval.reasons.is_empty());
    }

    #[test]
    fn hourly_velocity_trips_hold_threshold() {
        // 190 already posted this hour plus a 50-point proposal is 240,
        // over the 200/hour ceiling.
        let snap = WindowSnapshot {
            hourly_sum: 190,
            ..Default::default()
        };
        let eval = evaluate(
            &proposal(50, LedgerKind::Purchase),
            &snap,
            &limits(),
            OffsetDateTime::now_utc(),
        );
        assert!(eval.score >= limits().hold_threshold as i32);
        assert!(eval.reasons[0].contains("200"));
        assert!(eval.reasons[0].contains("hourly"));
    }

    #[test]
    fn exactly_at_hourly_cap_passes() {
        let snap = WindowSnapshot {
            hourly_sum: 150,
            ..Default::default()
        };
        let eval = evaluate(
            &proposal(50, LedgerKind::Purchase),
            &snap,
            &limits(),
            OffsetDateTime::now_utc(),
        );
        assert_eq!(eval.score, 0);
    }

    #[test]
    fn daily_velocity_trips_independently() {
        let snap = WindowSnapshot {
            hourly_sum: 0,
            daily_sum: 780,
            ..Default::default()
        };
        let eval = evaluate(
            &proposal(50, LedgerKind::Purchase),
            &snap,
            &limits(),
            OffsetDateTime::now_utc(),
        );
        assert_eq!(eval.score, SCORE_DAILY_VELOCITY);
        assert!(eval.reasons[0].contains("800"));
    }

    #[test]
    fn promo_count_rule_only_applies_to_promo_kinds() {
        let snap = WindowSnapshot {
            daily_promo_count: 3,
            ..Default::default()
        };
        let promo_eval = evaluate(
            &proposal(10, LedgerKind::PromoCredit),
            &snap,
            &limits(),
            OffsetDateTime::now_utc(),
        );
        assert_eq!(promo_eval.score, SCORE_PROMO_DAILY);

        let paid_eval = evaluate(
            &proposal(10, LedgerKind::Purchase),
            &snap,
            &limits(),
            OffsetDateTime::now_utc(),
        );
        assert_eq!(paid_eval.score, 0);
    }

    #[test]
    fn shared_customer_rule_counts_accounts() {
        let snap = WindowSnapshot {
            shared_customer_users: 3,
            ..Default::default()
        };
        let eval = evaluate(
            &proposal(10, LedgerKind::Purchase),
            &snap,
            &limits(),
            OffsetDateTime::now_utc(),
        );
        assert_eq!(eval.score, SCORE_SHARED_CUSTOMER);
        assert!(eval.reasons[0].contains("3 accounts"));
    }

    #[test]
    fn new_account_rule_needs_both_youth_and_velocity() {
        let now = OffsetDateTime::now_utc();
        let mut p = proposal(60, LedgerKind::Purchase);
        p.account_created_at = Some(now - Duration::minutes(10));
        let snap = WindowSnapshot {
            hourly_sum: 80,
            ..Default::default()
        };
        // 80 + 60 = 140 > 100 and the account is 10 minutes old.
        let eval = evaluate(&p, &snap, &limits(), now);
        assert_eq!(eval.score, SCORE_NEW_ACCOUNT);

        // Same velocity on an old account passes.
        p.account_created_at = Some(now - Duration::days(90));
        let eval = evaluate(&p, &snap, &limits(), now);
        assert_eq!(eval.score, 0);

        // Young account under the velocity bar passes too.
        p.account_created_at = Some(now - Duration::minutes(10));
        let quiet = WindowSnapshot::default();
        let eval = evaluate(&p, &quiet, &limits(), now);
        assert_eq!(eval.score, 0);
    }

    #[test]
    fn ip_velocity_requires_an_ip() {
        let snap = WindowSnapshot {
            ip_hourly_sum: 480,
            ..Default::default()
        };
        let mut p = proposal(50, LedgerKind::Purchase);
        let eval = evaluate(&p, &snap, &limits(), OffsetDateTime::now_utc());
        assert_eq!(eval.score, 0);

        p.ip = Some("203.0.113.7".into());
        let eval = evaluate(&p, &snap, &limits(), OffsetDateTime::now_utc());
        assert_eq!(eval.score, SCORE_IP_VELOCITY);
        assert!(eval.reasons[0].contains("500"));
    }

    #[test]
    fn rule_scores_accumulate() {
        let now = OffsetDateTime::now_utc();
        let mut p = proposal(100, LedgerKind::PromoCredit);
        p.account_created_at = Some(now - Duration::minutes(5));
        p.ip = Some("203.0.113.7".into());
        let snap = WindowSnapshot {
            hourly_sum: 150,
            daily_sum: 750,
            daily_promo_count: 5,
            ip_hourly_sum: 450,
            shared_customer_users: 4,
        };
        let eval = evaluate(&p, &snap, &limits(), now);
        assert_eq!(
            eval.score,
            SCORE_HOURLY_VELOCITY
                + SCORE_DAILY_VELOCITY
                + SCORE_PROMO_DAILY
                + SCORE_SHARED_CUSTOMER
                + SCORE_NEW_ACCOUNT
                + SCORE_IP_VELOCITY
        );
        assert_eq!(eval.reasons.len(), 6);
    }

    #[test]
    fn resolution_parse_round_trip() {
        assert_eq!(RiskResolution::parse("posted"), Some(RiskResolution::Posted));
        assert_eq!(
            RiskResolution::parse("reversed"),
            Some(RiskResolution::Reversed)
        );
        assert_eq!(RiskResolution::parse("hold"), None);
    }
}
