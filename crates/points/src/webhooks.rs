//! PayNow webhook ingress.
//!
//! Request lifecycle: verify the HMAC signature and timestamp freshness,
//! parse the envelope, atomically claim the event id, then process. The
//! claim is an INSERT..ON CONFLICT..RETURNING so only one concurrent
//! delivery wins; duplicates get an idempotent `already_processed` ack.
//! Nothing is written before the signature passes, so a misconfigured
//! sender can fix its secret and resend the same event id.
//!
//! Processing failures split two ways. Terminal business failures (unknown
//! product, unresolvable user, bad payload shape) are acknowledged with a
//! success-shaped response and recorded `failed_terminal`, stopping the
//! provider's retries. Transient failures record `failed` and surface an
//! error status so the retry eventually lands.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use qalam_shared::PointsConfig;

use crate::customers::CustomerDirectory;
use crate::error::{PointsError, PointsResult};
use crate::events::{from_epoch_millis, PaynowEvent, PaynowEventType};
use crate::risk::{CreditProposal, GateOutcome, RiskEngine};
use crate::subscriptions::{SubscriptionEventParams, SubscriptionService};
use crate::types::LedgerKind;

type HmacSha256 = Hmac<Sha256>;

/// Signed-timestamp freshness window, both directions.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;
/// A claimed event older than this is considered stuck and can be
/// re-claimed by a later delivery.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Compute the provider's signature for `"{timestamp}.{raw_body}"`.
pub fn sign_payload(secret: &str, timestamp_ms: i64, raw_body: &[u8]) -> PointsResult<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| PointsError::SignatureInvalid)?;
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Constant-time signature check plus replay protection. The timestamp
/// header is epoch milliseconds and must sit within five minutes of now.
pub fn verify_signature(
    secret: &str,
    timestamp_header: &str,
    raw_body: &[u8],
    signature_header: &str,
) -> PointsResult<()> {
    let timestamp: i64 = timestamp_header
        .trim()
        .parse()
        .map_err(|_| PointsError::SignatureInvalid)?;

    let now_ms = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let skew = now_ms - i128::from(timestamp);
    if skew.abs() > i128::from(SIGNATURE_TOLERANCE_SECS) * 1_000 {
        return Err(PointsError::StaleTimestamp);
    }

    let expected = sign_payload(secret, timestamp, raw_body)?;
    if bool::from(
        expected
            .as_bytes()
            .ct_eq(signature_header.trim().as_bytes()),
    ) {
        Ok(())
    } else {
        Err(PointsError::SignatureInvalid)
    }
}

/// Final disposition of one processed event, stored in the event's
/// `result` column and echoed in responses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Credited {
        ledger_ids: Vec<Uuid>,
        total_amount: i64,
        new_balance: i64,
        deduplicated: bool,
    },
    Held {
        risk_event_id: Uuid,
        score: i32,
    },
    SubscriptionUpdated {
        subscription_id: Uuid,
        status: String,
        credited: i64,
    },
    Ignored {
        reason: String,
    },
}

/// What the HTTP layer should tell the sender.
#[derive(Debug)]
pub enum IngestOutcome {
    Processed(ProcessOutcome),
    /// Recorded for queued processing; the push delivery does the rest.
    Accepted,
    AlreadyProcessed,
    /// Recorded `failed_terminal`; acknowledged so the sender stops
    /// retrying.
    TerminalFailure { reason: String },
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRow {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub status: String,
    pub attempts: i32,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaySummary {
    pub attempted: usize,
    pub processed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct WebhookHandler {
    pool: PgPool,
    config: Arc<PointsConfig>,
    directory: CustomerDirectory,
    risk: RiskEngine,
    subscriptions: SubscriptionService,
}

impl WebhookHandler {
    pub fn new(
        pool: PgPool,
        config: Arc<PointsConfig>,
        directory: CustomerDirectory,
        risk: RiskEngine,
        subscriptions: SubscriptionService,
    ) -> Self {
        Self {
            pool,
            config,
            directory,
            risk,
            subscriptions,
        }
    }

    /// Handle one signed delivery from the provider.
    pub async fn ingest(
        &self,
        raw_body: &[u8],
        timestamp_header: Option<&str>,
        signature_header: Option<&str>,
        client_ip: Option<&str>,
    ) -> PointsResult<IngestOutcome> {
        let timestamp = timestamp_header.ok_or(PointsError::SignatureInvalid)?;
        let signature = signature_header.ok_or(PointsError::SignatureInvalid)?;
        verify_signature(&self.config.webhook_secret, timestamp, raw_body, signature)?;

        let event = PaynowEvent::parse(raw_body)?;
        let payload_hash = hex::encode(Sha256::digest(raw_body));

        if !self.config.webhook_inline_processing {
            return if self.record_unclaimed(&event, &payload_hash).await? {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook recorded for queued processing"
                );
                Ok(IngestOutcome::Accepted)
            } else {
                self.log_duplicate(&event.id).await;
                Ok(IngestOutcome::AlreadyProcessed)
            };
        }

        let Some(_claim) = self.claim_event(&event, Some(&payload_hash)).await? else {
            self.log_duplicate(&event.id).await;
            return Ok(IngestOutcome::AlreadyProcessed);
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event (claimed exclusive processing rights)"
        );

        self.process_and_record(&event, client_ip).await
    }

    /// Atomically claim an event id for processing. Returns `None` when
    /// another delivery holds or finished it. Re-claims are allowed for
    /// recorded-but-unclaimed rows, transient failures, and claims stuck
    /// past the timeout.
    pub(crate) async fn claim_event(
        &self,
        event: &PaynowEvent,
        payload_hash: Option<&str>,
    ) -> PointsResult<Option<Uuid>> {
        let payload = serde_json::to_value(event).unwrap_or(JsonValue::Null);
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (event_id, event_type, payload, payload_hash, status, attempts, processing_started_at)
            VALUES ($1, $2, $3, $4, 'received', 1, NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                status = 'received',
                processing_started_at = NOW(),
                attempts = webhook_events.attempts + 1
            WHERE webhook_events.status = 'failed'
               OR (webhook_events.status = 'received'
                   AND (webhook_events.processing_started_at IS NULL
                        OR webhook_events.processing_started_at < NOW() - ($5 || ' minutes')::INTERVAL))
            RETURNING id
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&payload)
        .bind(payload_hash)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.map(|(id,)| id))
    }

    /// Record an event without claiming it; the queue push claims later.
    /// Returns false for an already-known event id.
    async fn record_unclaimed(
        &self,
        event: &PaynowEvent,
        payload_hash: &str,
    ) -> PointsResult<bool> {
        let payload = serde_json::to_value(event).unwrap_or(JsonValue::Null);
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (event_id, event_type, payload, payload_hash, status, attempts)
            VALUES ($1, $2, $3, $4, 'received', 0)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&payload)
        .bind(payload_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted.is_some())
    }

    async fn log_duplicate(&self, event_id: &str) {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT status FROM webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await
                .ok()
                .flatten();

        let reason = match existing.as_ref().map(|(s,)| s.as_str()) {
            Some("processed") => "already processed successfully",
            Some("received") => "currently claimed by another delivery",
            Some("failed_terminal") => "previously failed terminally",
            Some(_) => "exists with another status",
            None => "unknown (race condition?)",
        };
        tracing::info!(
            event_id = %event_id,
            reason = %reason,
            "Duplicate webhook event - atomic idempotency check"
        );
    }

    /// Process a claimed event and persist the disposition. Success marks
    /// `processed` inside the same transaction as the side effects.
    pub(crate) async fn process_and_record(
        &self,
        event: &PaynowEvent,
        client_ip: Option<&str>,
    ) -> PointsResult<IngestOutcome> {
        match self.process_claimed_event(event, client_ip).await {
            Ok(outcome) => Ok(IngestOutcome::Processed(outcome)),
            Err(e) if e.is_terminal() => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook failed terminally - acknowledging to stop retries"
                );
                self.record_failure(&event.id, "failed_terminal", &e.to_string())
                    .await;
                Ok(IngestOutcome::TerminalFailure {
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed - sender will retry"
                );
                self.record_failure(&event.id, "failed", &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn process_claimed_event(
        &self,
        event: &PaynowEvent,
        client_ip: Option<&str>,
    ) -> PointsResult<ProcessOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = self.dispatch(&mut tx, event, client_ip).await?;

        let result = serde_json::to_value(&outcome).unwrap_or(JsonValue::Null);
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processed', processed_at = NOW(), result = $2, error_message = NULL
            WHERE event_id = $1
            "#,
        )
        .bind(&event.id)
        .bind(&result)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &PaynowEvent,
        client_ip: Option<&str>,
    ) -> PointsResult<ProcessOutcome> {
        match event.kind() {
            PaynowEventType::OrderCompleted => {
                self.handle_order_completed(tx, event, client_ip).await
            }
            PaynowEventType::DeliveryItemAdded => {
                self.handle_delivery_item(tx, event, client_ip).await
            }
            PaynowEventType::SubscriptionActivated => {
                self.handle_subscription_lifecycle(tx, event, false).await
            }
            PaynowEventType::SubscriptionRenewed => {
                self.handle_subscription_lifecycle(tx, event, true).await
            }
            PaynowEventType::SubscriptionCanceled => {
                self.handle_subscription_closed(tx, event, "canceled").await
            }
            PaynowEventType::SubscriptionExpired => {
                self.handle_subscription_closed(tx, event, "expired").await
            }
            PaynowEventType::Unknown(t) => Err(PointsError::InvalidPayload(format!(
                "unhandled event type '{t}'"
            ))),
        }
    }

    /// Credit each order line through the velocity gate. Line action ids
    /// derive from order id + product id, so a replayed order dedupes per
    /// line.
    async fn handle_order_completed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &PaynowEvent,
        client_ip: Option<&str>,
    ) -> PointsResult<ProcessOutcome> {
        let order = event.order()?;
        let customer = order
            .customer
            .as_ref()
            .ok_or_else(|| PointsError::InvalidPayload("order.completed missing customer".into()))?;
        let resolved = self.directory.resolve(customer).await?;

        if order.lines.is_empty() {
            return Ok(ProcessOutcome::Ignored {
                reason: "order has no lines".into(),
            });
        }

        let mut ledger_ids = Vec::new();
        let mut total_amount = 0i64;
        let mut new_balance = 0i64;
        let mut all_deduplicated = true;
        let mut first_hold: Option<(Uuid, i32)> = None;

        for line in &order.lines {
            let per_unit = self
                .config
                .points_for_product(&line.product_id)
                .ok_or_else(|| PointsError::UnknownProduct(line.product_id.clone()))?;
            let amount = per_unit * line.quantity.max(1);

            let proposal = CreditProposal {
                user_id: resolved.user_id.clone(),
                amount,
                kind: LedgerKind::Purchase,
                action_id: format!("order:{}:{}", order.id, line.product_id),
                source: serde_json::json!({
                    "provider": "paynow",
                    "event_id": event.id,
                    "order_id": order.id,
                    "product_id": line.product_id,
                    "quantity": line.quantity,
                }),
                expires_at: None,
                provider_customer_id: customer.id.clone(),
                ip: client_ip.map(str::to_string),
                account_created_at: resolved.account_created_at,
                created_by: "system:webhook".into(),
            };

            match self.risk.gate_credit_in_tx(tx, &proposal).await? {
                GateOutcome::Posted(outcome) => {
                    all_deduplicated &= outcome.deduplicated;
                    new_balance = outcome.new_balance;
                    total_amount += amount;
                    ledger_ids.push(outcome.ledger_id);
                }
                GateOutcome::Held {
                    risk_event_id,
                    score,
                    ..
                } => {
                    if first_hold.is_none() {
                        first_hold = Some((risk_event_id, score));
                    }
                }
            }
        }

        if let Some((risk_event_id, score)) = first_hold {
            return Ok(ProcessOutcome::Held {
                risk_event_id,
                score,
            });
        }

        Ok(ProcessOutcome::Credited {
            ledger_ids,
            total_amount,
            new_balance,
            deduplicated: all_deduplicated,
        })
    }

    /// Item deliveries come in two flavors. Order-linked deliveries reuse
    /// the order credit's action id, so whichever event lands first wins
    /// and the other dedupes. Standalone deliveries are gift grants and
    /// post as expiring promo credits.
    async fn handle_delivery_item(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &PaynowEvent,
        client_ip: Option<&str>,
    ) -> PointsResult<ProcessOutcome> {
        let item = event.delivery_item()?;
        let customer = item.customer.as_ref().ok_or_else(|| {
            PointsError::InvalidPayload("delivery.item.added missing customer".into())
        })?;
        let resolved = self.directory.resolve(customer).await?;

        let per_unit = self
            .config
            .points_for_product(&item.product_id)
            .ok_or_else(|| PointsError::UnknownProduct(item.product_id.clone()))?;
        let amount = per_unit * item.quantity.max(1);

        let (action_id, kind, expires_at) = match item.order_id.as_deref() {
            Some(order_id) => (
                format!("order:{order_id}:{}", item.product_id),
                LedgerKind::Purchase,
                None,
            ),
            None => {
                let expires = item.expires_at.and_then(from_epoch_millis).unwrap_or_else(|| {
                    OffsetDateTime::now_utc()
                        + time::Duration::days(self.config.subscription_promo_expiry_days)
                });
                (
                    format!("delivery:{}:{}", item.delivery_id, item.product_id),
                    LedgerKind::PromoCredit,
                    Some(expires),
                )
            }
        };

        let proposal = CreditProposal {
            user_id: resolved.user_id.clone(),
            amount,
            kind,
            action_id,
            source: serde_json::json!({
                "provider": "paynow",
                "event_id": event.id,
                "delivery_id": item.delivery_id,
                "order_id": item.order_id,
                "product_id": item.product_id,
                "quantity": item.quantity,
            }),
            expires_at,
            provider_customer_id: customer.id.clone(),
            ip: client_ip.map(str::to_string),
            account_created_at: resolved.account_created_at,
            created_by: "system:webhook".into(),
        };

        match self.risk.gate_credit_in_tx(tx, &proposal).await? {
            GateOutcome::Posted(outcome) => Ok(ProcessOutcome::Credited {
                ledger_ids: vec![outcome.ledger_id],
                total_amount: amount,
                new_balance: outcome.new_balance,
                deduplicated: outcome.deduplicated,
            }),
            GateOutcome::Held {
                risk_event_id,
                score,
                ..
            } => Ok(ProcessOutcome::Held {
                risk_event_id,
                score,
            }),
        }
    }

    async fn handle_subscription_lifecycle(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &PaynowEvent,
        renewal: bool,
    ) -> PointsResult<ProcessOutcome> {
        let sub = event.subscription()?;
        let customer = sub.customer.as_ref().ok_or_else(|| {
            PointsError::InvalidPayload("subscription event missing customer".into())
        })?;
        let resolved = self.directory.resolve(customer).await?;
        let plan = self
            .config
            .plan_for_product(&sub.product_id)
            .ok_or_else(|| PointsError::UnknownProduct(sub.product_id.clone()))?;

        let params = SubscriptionEventParams {
            user_id: resolved.user_id,
            provider_subscription_id: sub.id.clone(),
            provider_order_id: sub.order_id.clone(),
            product_id: sub.product_id.clone(),
            current_period_end: sub.current_period_end.and_then(from_epoch_millis),
            event_id: event.id.clone(),
        };

        let change = if renewal {
            self.subscriptions.renew_in_tx(tx, &params, plan).await?
        } else {
            self.subscriptions.activate_in_tx(tx, &params, plan).await?
        };

        Ok(ProcessOutcome::SubscriptionUpdated {
            subscription_id: change.subscription_id,
            status: "active".into(),
            credited: change.credited,
        })
    }

    async fn handle_subscription_closed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &PaynowEvent,
        status: &str,
    ) -> PointsResult<ProcessOutcome> {
        let sub = event.subscription()?;
        match self
            .subscriptions
            .mark_terminal_in_tx(tx, &sub.id, status)
            .await?
        {
            Some(subscription_id) => Ok(ProcessOutcome::SubscriptionUpdated {
                subscription_id,
                status: status.to_string(),
                credited: 0,
            }),
            None => Ok(ProcessOutcome::Ignored {
                reason: format!("subscription {} unknown or already closed", sub.id),
            }),
        }
    }

    /// Persist a failure disposition. Retried once; the record backs
    /// idempotency, so losing it can leave the event claimable forever.
    pub(crate) async fn record_failure(&self, event_id: &str, status: &str, message: &str) {
        let write = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, error_message = $3, result = NULL
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(status)
        .bind(message)
        .execute(&self.pool)
        .await;

        if let Err(e) = write {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to record webhook failure failed, retrying..."
            );
            if let Err(retry_err) = sqlx::query(
                r#"
                UPDATE webhook_events
                SET status = $2, error_message = $3, result = NULL
                WHERE event_id = $1
                "#,
            )
            .bind(event_id)
            .bind(status)
            .bind(message)
            .execute(&self.pool)
            .await
            {
                tracing::error!(
                    event_id = %event_id,
                    status = %status,
                    first_error = %e,
                    retry_error = %retry_err,
                    "CRITICAL: failed to record webhook disposition after retry; event may stay claimed until the stuck timeout"
                );
            }
        }
    }

    /// Re-run a stored event from its persisted payload. Works on failed
    /// and terminally-failed rows; processed rows return the idempotent
    /// ack.
    pub async fn replay_webhook(&self, event_id: &str) -> PointsResult<IngestOutcome> {
        let row: Option<(JsonValue, String)> =
            sqlx::query_as("SELECT payload, status FROM webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((payload, status)) = row else {
            return Err(PointsError::not_found("webhook event", event_id));
        };
        if status == "processed" {
            return Ok(IngestOutcome::AlreadyProcessed);
        }

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'received', processing_started_at = NOW(), attempts = attempts + 1
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        let event = PaynowEvent::from_value(payload)?;
        tracing::info!(event_id = %event_id, "Replaying stored webhook event");
        self.process_and_record(&event, None).await
    }

    /// Replay every transiently-failed event, oldest first. Per-event
    /// errors are counted, not propagated.
    pub async fn replay_all_failed(&self, max: i64) -> PointsResult<ReplaySummary> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT event_id FROM webhook_events
            WHERE status = 'failed'
            ORDER BY received_at ASC
            LIMIT $1
            "#,
        )
        .bind(max.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ReplaySummary {
            attempted: ids.len(),
            ..Default::default()
        };
        for (event_id,) in ids {
            match self.replay_webhook(&event_id).await {
                Ok(IngestOutcome::Processed(_)) | Ok(IngestOutcome::AlreadyProcessed) => {
                    summary.processed += 1;
                }
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(event_id = %event_id, error = %e, "Replay failed");
                }
            }
        }

        tracing::info!(
            attempted = summary.attempted,
            processed = summary.processed,
            failed = summary.failed,
            "Failed-webhook replay sweep complete"
        );
        Ok(summary)
    }

    pub async fn list_webhook_events(
        &self,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> PointsResult<Vec<WebhookEventRow>> {
        let rows = sqlx::query_as::<_, WebhookEventRow>(
            r#"
            SELECT id, event_id, event_type, status, attempts, result, error_message,
                   received_at, processing_started_at, processed_at
            FROM webhook_events
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status)
        .bind(limit.clamp(1, 200))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_points_test_secret";

    fn now_ms() -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }

    #[test]
    fn valid_signature_round_trips() {
        let body = br#"{"id":"evt_1","event_type":"order.completed","data":{}}"#;
        let ts = now_ms();
        let sig = sign_payload(SECRET, ts, body).unwrap();
        assert!(verify_signature(SECRET, &ts.to_string(), body, &sig).is_ok());
    }

    #[test]
    fn flipped_signature_byte_is_rejected() {
        let body = b"payload";
        let ts = now_ms();
        let sig = sign_payload(SECRET, ts, body).unwrap();

        let mut flipped: Vec<char> = sig.chars().collect();
        flipped[0] = if flipped[0] == 'A' { 'B' } else { 'A' };
        let flipped: String = flipped.into_iter().collect();

        assert!(matches!(
            verify_signature(SECRET, &ts.to_string(), body, &flipped),
            Err(PointsError::SignatureInvalid)
        ));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let ts = now_ms();
        let sig = sign_payload(SECRET, ts, b"original").unwrap();
        assert!(matches!(
            verify_signature(SECRET, &ts.to_string(), b"tampered", &sig),
            Err(PointsError::SignatureInvalid)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"payload";
        let ts = now_ms();
        let sig = sign_payload("other_secret", ts, body).unwrap();
        assert!(matches!(
            verify_signature(SECRET, &ts.to_string(), body, &sig),
            Err(PointsError::SignatureInvalid)
        ));
    }

    #[test]
    fn four_minute_old_timestamp_is_fresh() {
        let body = b"payload";
        let ts = now_ms() - 4 * 60 * 1_000;
        let sig = sign_payload(SECRET, ts, body).unwrap();
        assert!(verify_signature(SECRET, &ts.to_string(), body, &sig).is_ok());
    }

    #[test]
    fn six_minute_old_timestamp_is_stale() {
        let body = b"payload";
        let ts = now_ms() - 6 * 60 * 1_000;
        let sig = sign_payload(SECRET, ts, body).unwrap();
        assert!(matches!(
            verify_signature(SECRET, &ts.to_string(), body, &sig),
            Err(PointsError::StaleTimestamp)
        ));
    }

    #[test]
    fn future_skew_is_also_stale() {
        let body = b"payload";
        let ts = now_ms() + 6 * 60 * 1_000;
        let sig = sign_payload(SECRET, ts, body).unwrap();
        assert!(matches!(
            verify_signature(SECRET, &ts.to_string(), body, &sig),
            Err(PointsError::StaleTimestamp)
        ));
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        let body = b"payload";
        let sig = sign_payload(SECRET, now_ms(), body).unwrap();
        assert!(matches!(
            verify_signature(SECRET, "not-a-number", body, &sig),
            Err(PointsError::SignatureInvalid)
        ));
    }

    #[test]
    fn process_outcome_serializes_with_tag() {
        let outcome = ProcessOutcome::Ignored {
            reason: "order has no lines".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "ignored");
        assert_eq!(json["reason"], "order has no lines");
    }
}
