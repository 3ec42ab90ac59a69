//! PayNow webhook event types.
//!
//! Events arrive as a JSON envelope with a provider event id, a dotted
//! event-type string, and a `data` section whose shape depends on the type.
//! The typed [`PaynowEventType`] enum keys the dispatch table so a new
//! handled type is a compile-visible match arm, with `Unknown` carrying
//! anything the provider adds before we do.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::error::{PointsError, PointsResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaynowEventType {
    OrderCompleted,
    DeliveryItemAdded,
    SubscriptionActivated,
    SubscriptionRenewed,
    SubscriptionCanceled,
    SubscriptionExpired,
    Unknown(String),
}

impl PaynowEventType {
    pub fn parse(s: &str) -> Self {
        match s {
            "order.completed" => PaynowEventType::OrderCompleted,
            "delivery.item.added" => PaynowEventType::DeliveryItemAdded,
            "subscription.activated" => PaynowEventType::SubscriptionActivated,
            "subscription.renewed" => PaynowEventType::SubscriptionRenewed,
            "subscription.canceled" => PaynowEventType::SubscriptionCanceled,
            "subscription.expired" => PaynowEventType::SubscriptionExpired,
            other => PaynowEventType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PaynowEventType::OrderCompleted => "order.completed",
            PaynowEventType::DeliveryItemAdded => "delivery.item.added",
            PaynowEventType::SubscriptionActivated => "subscription.activated",
            PaynowEventType::SubscriptionRenewed => "subscription.renewed",
            PaynowEventType::SubscriptionCanceled => "subscription.canceled",
            PaynowEventType::SubscriptionExpired => "subscription.expired",
            PaynowEventType::Unknown(s) => s,
        }
    }
}

impl std::fmt::Display for PaynowEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Customer section embedded in order/subscription/delivery payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaynowCustomer {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, JsonValue>,
}

impl PaynowCustomer {
    /// Explicit uid set by our checkout page at session creation.
    pub fn metadata_user_id(&self) -> Option<&str> {
        self.metadata.get("user_id").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderData {
    pub id: String,
    #[serde(default)]
    pub customer: Option<PaynowCustomer>,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub product_id: String,
    #[serde(default)]
    pub customer: Option<PaynowCustomer>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryItemData {
    pub delivery_id: String,
    /// Present when the delivery fulfils a paid order; the action id then
    /// collides with the order credit on purpose so only one applies.
    #[serde(default)]
    pub order_id: Option<String>,
    pub product_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub customer: Option<PaynowCustomer>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

fn default_quantity() -> i64 {
    1
}

/// Verified webhook envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaynowEvent {
    pub id: String,
    pub event_type: String,
    /// Provider-side event time, epoch milliseconds.
    #[serde(default)]
    pub occurred_at: Option<i64>,
    #[serde(default)]
    pub data: JsonValue,
}

impl PaynowEvent {
    pub fn parse(raw: &[u8]) -> PointsResult<Self> {
        let value: JsonValue = serde_json::from_slice(raw)
            .map_err(|e| PointsError::InvalidPayload(format!("malformed event JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Parse an already-decoded envelope, e.g. the stored copy used by
    /// replay or the queue push body.
    pub fn from_value(value: JsonValue) -> PointsResult<Self> {
        let event: PaynowEvent = serde_json::from_value(value)
            .map_err(|e| PointsError::InvalidPayload(format!("malformed event JSON: {e}")))?;
        if event.id.is_empty() {
            return Err(PointsError::InvalidPayload("missing event id".into()));
        }
        if event.event_type.is_empty() {
            return Err(PointsError::InvalidPayload("missing event type".into()));
        }
        Ok(event)
    }

    pub fn kind(&self) -> PaynowEventType {
        PaynowEventType::parse(&self.event_type)
    }

    pub fn order(&self) -> PointsResult<OrderData> {
        self.section("order")
    }

    pub fn subscription(&self) -> PointsResult<SubscriptionData> {
        self.section("subscription")
    }

    pub fn delivery_item(&self) -> PointsResult<DeliveryItemData> {
        self.section("item")
    }

    fn section<T: serde::de::DeserializeOwned>(&self, key: &str) -> PointsResult<T> {
        let value = self
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| PointsError::InvalidPayload(format!("missing data.{key}")))?;
        serde_json::from_value(value)
            .map_err(|e| PointsError::InvalidPayload(format!("bad data.{key}: {e}")))
    }
}

/// Convert a provider epoch-milliseconds timestamp.
pub fn from_epoch_millis(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips() {
        for s in [
            "order.completed",
            "delivery.item.added",
            "subscription.activated",
            "subscription.renewed",
            "subscription.canceled",
            "subscription.expired",
        ] {
            assert_eq!(PaynowEventType::parse(s).as_str(), s);
        }
        match PaynowEventType::parse("order.refunded") {
            PaynowEventType::Unknown(s) => assert_eq!(s, "order.refunded"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn parses_order_envelope() {
        let raw = serde_json::json!({
            "id": "evt_1",
            "event_type": "order.completed",
            "occurred_at": 1756100000000i64,
            "data": {
                "order": {
                    "id": "ord_1",
                    "customer": {
                        "id": "cus_1",
                        "email": "reader@example.com",
                        "metadata": {"user_id": "u_42"}
                    },
                    "lines": [{"product_id": "prod_basic", "quantity": 2}]
                }
            }
        });
        let event = PaynowEvent::parse(raw.to_string().as_bytes()).unwrap();
        assert_eq!(event.kind(), PaynowEventType::OrderCompleted);

        let order = event.order().unwrap();
        assert_eq!(order.id, "ord_1");
        assert_eq!(order.lines.len(), 1);
        assert_eq!(order.lines[0].quantity, 2);
        let customer = order.customer.unwrap();
        assert_eq!(customer.metadata_user_id(), Some("u_42"));
    }

    #[test]
    fn quantity_defaults_to_one() {
        let raw = serde_json::json!({
            "id": "evt_2",
            "event_type": "order.completed",
            "data": {"order": {"id": "ord_2", "lines": [{"product_id": "prod_basic"}]}}
        });
        let event = PaynowEvent::parse(raw.to_string().as_bytes()).unwrap();
        assert_eq!(event.order().unwrap().lines[0].quantity, 1);
    }

    #[test]
    fn rejects_missing_id_and_type() {
        let no_id = serde_json::json!({"id": "", "event_type": "order.completed"});
        assert!(matches!(
            PaynowEvent::parse(no_id.to_string().as_bytes()),
            Err(PointsError::InvalidPayload(_))
        ));

        let no_type = serde_json::json!({"id": "evt_3", "event_type": ""});
        assert!(matches!(
            PaynowEvent::parse(no_type.to_string().as_bytes()),
            Err(PointsError::InvalidPayload(_))
        ));

        assert!(matches!(
            PaynowEvent::parse(b"not json"),
            Err(PointsError::InvalidPayload(_))
        ));
    }

    #[test]
    fn missing_section_is_invalid_payload() {
        let raw = serde_json::json!({
            "id": "evt_4",
            "event_type": "subscription.activated",
            "data": {}
        });
        let event = PaynowEvent::parse(raw.to_string().as_bytes()).unwrap();
        assert!(matches!(
            event.subscription(),
            Err(PointsError::InvalidPayload(_))
        ));
    }

    #[test]
    fn epoch_millis_conversion() {
        let ts = from_epoch_millis(1756100000000).unwrap();
        assert_eq!(ts.unix_timestamp(), 1756100000);
        assert!(from_epoch_millis(i64::MAX).is_none());
    }
}
