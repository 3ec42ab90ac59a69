//! Push-queue processing for webhook events.
//!
//! Deliveries arrive as Pub/Sub-style push envelopes with a base64 JSON
//! job inside. The processor re-checks idempotency through the same
//! claim path as inline ingress, so a direct delivery and a queued one
//! can never both post. Retry policy is inverted from HTTP ingress: the
//! queue owns redelivery, so transient failures surface as errors (the
//! HTTP layer answers 5xx and the queue tries again) while terminal
//! failures are acknowledged and recorded `failed_terminal`.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use qalam_shared::PointsConfig;

use crate::error::{PointsError, PointsResult};
use crate::events::PaynowEvent;
use crate::webhooks::{IngestOutcome, ProcessOutcome, WebhookHandler};

/// Push delivery wrapper. Field names follow the queue's JSON casing.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default, rename = "deliveryAttempt")]
    pub delivery_attempt: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushMessage {
    /// Base64-encoded [`QueuedWebhookJob`] JSON.
    pub data: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default, rename = "messageId")]
    pub message_id: Option<String>,
    #[serde(default, rename = "publishTime")]
    pub publish_time: Option<String>,
}

#[derive(Debug)]
pub struct QueuedWebhookJob {
    pub schema_version: u32,
    pub event: PaynowEvent,
    pub received_at: Option<OffsetDateTime>,
}

/// What the push endpoint should answer. Everything here is an ack;
/// transient failures come back as `Err` instead.
#[derive(Debug)]
pub enum PushDisposition {
    Processed(ProcessOutcome),
    /// Event already settled by another delivery.
    Duplicate,
    /// Terminal failure, recorded and acknowledged so the queue stops.
    Dropped { reason: String },
}

#[derive(Clone)]
pub struct QueueProcessor {
    config: Arc<PointsConfig>,
    webhooks: WebhookHandler,
}

impl QueueProcessor {
    pub fn new(config: Arc<PointsConfig>, webhooks: WebhookHandler) -> Self {
        Self { config, webhooks }
    }

    pub async fn handle_push(&self, envelope: PushEnvelope) -> PointsResult<PushDisposition> {
        let message_id = envelope.message.message_id.clone().unwrap_or_default();
        let delivery_attempt = envelope.delivery_attempt;

        let job = match decode_job(&envelope) {
            Ok(job) => job,
            Err(e) if e.is_terminal() => {
                tracing::warn!(
                    message_id = %message_id,
                    error = %e,
                    "Dropping undecodable queue message"
                );
                return Ok(PushDisposition::Dropped {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        if job.schema_version < self.config.min_schema_version {
            let err = PointsError::SchemaTooOld {
                got: job.schema_version,
                min: self.config.min_schema_version,
            };
            tracing::warn!(
                event_id = %job.event.id,
                schema_version = job.schema_version,
                min_schema_version = self.config.min_schema_version,
                "Dropping queue message with stale schema"
            );
            if self.webhooks.claim_event(&job.event, None).await?.is_some() {
                self.webhooks
                    .record_failure(&job.event.id, "failed_terminal", &err.to_string())
                    .await;
            }
            return Ok(PushDisposition::Dropped {
                reason: err.to_string(),
            });
        }

        let Some(_claim) = self.webhooks.claim_event(&job.event, None).await? else {
            tracing::info!(
                event_id = %job.event.id,
                message_id = %message_id,
                "Queue delivery for an already-settled event"
            );
            return Ok(PushDisposition::Duplicate);
        };

        tracing::info!(
            event_id = %job.event.id,
            event_type = %job.event.event_type,
            delivery_attempt = ?delivery_attempt,
            "Processing queued webhook event"
        );

        match self.webhooks.process_and_record(&job.event, None).await? {
            IngestOutcome::Processed(outcome) => Ok(PushDisposition::Processed(outcome)),
            IngestOutcome::TerminalFailure { reason } => Ok(PushDisposition::Dropped { reason }),
            IngestOutcome::Accepted | IngestOutcome::AlreadyProcessed => {
                Ok(PushDisposition::Duplicate)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireJob {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    event: JsonValue,
    #[serde(default, with = "time::serde::rfc3339::option")]
    received_at: Option<OffsetDateTime>,
}

fn default_schema_version() -> u32 {
    1
}

fn decode_job(envelope: &PushEnvelope) -> PointsResult<QueuedWebhookJob> {
    let raw = BASE64
        .decode(envelope.message.data.as_bytes())
        .map_err(|e| PointsError::InvalidPayload(format!("push data is not base64: {e}")))?;
    let wire: WireJob = serde_json::from_slice(&raw)
        .map_err(|e| PointsError::InvalidPayload(format!("queued job is not valid JSON: {e}")))?;
    let event = PaynowEvent::from_value(wire.event)?;
    Ok(QueuedWebhookJob {
        schema_version: wire.schema_version,
        event,
        received_at: wire.received_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_for(job: JsonValue) -> PushEnvelope {
        let data = BASE64.encode(serde_json::to_vec(&job).unwrap());
        serde_json::from_value(serde_json::json!({
            "message": {
                "data": data,
                "messageId": "m-1",
                "publishTime": "2026-03-01T00:00:00Z",
            },
            "subscription": "projects/x/subscriptions/points",
            "deliveryAttempt": 2,
        }))
        .unwrap()
    }

    #[test]
    fn job_round_trips_through_envelope() {
        let envelope = envelope_for(serde_json::json!({
            "schema_version": 2,
            "received_at": "2026-03-01T00:00:00Z",
            "event": {
                "id": "evt_q1",
                "event_type": "order.completed",
                "data": {"order": {"id": "ord_1", "lines": []}},
            },
        }));

        assert_eq!(envelope.delivery_attempt, Some(2));
        assert_eq!(envelope.message.message_id.as_deref(), Some("m-1"));

        let job = decode_job(&envelope).unwrap();
        assert_eq!(job.schema_version, 2);
        assert_eq!(job.event.id, "evt_q1");
        assert!(job.received_at.is_some());
    }

    #[test]
    fn schema_version_defaults_to_one() {
        let envelope = envelope_for(serde_json::json!({
            "event": {"id": "evt_q2", "event_type": "order.completed", "data": {}},
        }));
        let job = decode_job(&envelope).unwrap();
        assert_eq!(job.schema_version, 1);
    }

    #[test]
    fn garbage_base64_is_terminal() {
        let envelope: PushEnvelope = serde_json::from_value(serde_json::json!({
            "message": {"data": "%%% not base64 %%%"},
        }))
        .unwrap();
        let err = decode_job(&envelope).unwrap_err();
        assert!(matches!(err, PointsError::InvalidPayload(_)));
        assert!(err.is_terminal());
    }

    #[test]
    fn non_json_payload_is_terminal() {
        let envelope: PushEnvelope = serde_json::from_value(serde_json::json!({
            "message": {"data": BASE64.encode(b"not json")},
        }))
        .unwrap();
        let err = decode_job(&envelope).unwrap_err();
        assert!(matches!(err, PointsError::InvalidPayload(_)));
    }

    #[test]
    fn event_missing_id_is_rejected() {
        let envelope = envelope_for(serde_json::json!({
            "schema_version": 1,
            "event": {"id": "", "event_type": "order.completed", "data": {}},
        }));
        assert!(matches!(
            decode_job(&envelope),
            Err(PointsError::InvalidPayload(_))
        ));
    }
}
