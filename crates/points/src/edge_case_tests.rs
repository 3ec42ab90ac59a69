// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Points System
//!
//! Tests critical boundary conditions in:
//! - Spend planning (PTS-SP01 to PTS-SP05)
//! - Subscription month arithmetic (PTS-SM01 to PTS-SM04)
//! - Webhook signature window (PTS-WS01 to PTS-WS04)
//! - Event envelope parsing (PTS-EV01 to PTS-EV04)
//! - Risk scoring (PTS-RS01 to PTS-RS04)

#[cfg(test)]
mod spend_planning_tests {
    use crate::error::PointsError;
    use crate::ledger::{plan_spend, LotView};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn lot(remaining: i64, expires_in_days: i64) -> LotView {
        LotView {
            id: Uuid::new_v4(),
            remaining_points: remaining,
            expires_at: OffsetDateTime::now_utc() + Duration::days(expires_in_days),
        }
    }

    // =========================================================================
    // PTS-SP01: Spend exactly the promo total - every lot drains, paid at 0
    // =========================================================================
    #[test]
    fn test_exact_promo_total_drains_all_lots() {
        let lots = vec![lot(20, 3), lot(30, 10)];
        let plan = plan_spend(50, &lots, 100, false).unwrap();

        assert_eq!(plan.draws.len(), 2, "Both lots should be drawn");
        assert_eq!(plan.promo_spent, 50);
        assert_eq!(plan.paid_spent, 0, "Paid balance should be untouched");
        let drawn: i64 = plan.draws.iter().map(|(_, d)| d).sum();
        assert_eq!(drawn, 50);
    }

    // =========================================================================
    // PTS-SP02: Spend larger than promo - remainder comes from paid
    // =========================================================================
    #[test]
    fn test_overflow_into_paid_balance() {
        let lots = vec![lot(20, 3), lot(30, 10)];
        let plan = plan_spend(75, &lots, 100, false).unwrap();

        assert_eq!(plan.promo_spent, 50, "All promo should drain first");
        assert_eq!(plan.paid_spent, 25);
    }

    // =========================================================================
    // PTS-SP03: Cost above promo+paid - error reports the true available
    // =========================================================================
    #[test]
    fn test_insufficient_reports_combined_available() {
        let lots = vec![lot(20, 3), lot(30, 10)];
        let err = plan_spend(200, &lots, 100, false).unwrap_err();

        match err {
            PointsError::InsufficientBalance { needed, available } => {
                assert_eq!(needed, 200);
                assert_eq!(available, 150, "Available should be promo 50 + paid 100");
            }
            other => panic!("Expected InsufficientBalance, got {other:?}"),
        }
    }

    // =========================================================================
    // PTS-SP04: Negative-balance flag - paid side may overdraw
    // =========================================================================
    #[test]
    fn test_negative_flag_permits_overdraw() {
        let lots = vec![lot(10, 3)];
        let plan = plan_spend(100, &lots, 40, true).unwrap();

        assert_eq!(plan.promo_spent, 10);
        assert_eq!(plan.paid_spent, 90, "Paid side may exceed the 40 on hand");
    }

    // =========================================================================
    // PTS-SP05: Empty lot in the slice - never produces a zero draw
    // =========================================================================
    #[test]
    fn test_empty_lot_is_skipped() {
        let empty = lot(0, 1);
        let full = lot(30, 5);
        let plan = plan_spend(20, &[empty.clone(), full.clone()], 0, false).unwrap();

        assert_eq!(plan.draws.len(), 1);
        assert_eq!(plan.draws[0], (full.id, 20));
        assert!(
            plan.draws.iter().all(|(id, _)| *id != empty.id),
            "Drained-out lot must not appear in the plan"
        );
    }
}

#[cfg(test)]
mod month_arithmetic_tests {
    use crate::subscriptions::add_months;
    use time::macros::datetime;

    // =========================================================================
    // PTS-SM01: Jan 31 + 1 month - clamps to Feb 28 in a common year
    // =========================================================================
    #[test]
    fn test_jan_31_clamps_to_feb_28() {
        let next = add_months(datetime!(2026-01-31 09:00 UTC), 1);
        assert_eq!(next, datetime!(2026-02-28 09:00 UTC));
    }

    // =========================================================================
    // PTS-SM02: Clamped date does not bounce back - Feb 28 + 1 is Mar 28
    // =========================================================================
    #[test]
    fn test_clamped_day_stays_clamped() {
        let next = add_months(datetime!(2026-02-28 09:00 UTC), 1);
        assert_eq!(next, datetime!(2026-03-28 09:00 UTC));
    }

    // =========================================================================
    // PTS-SM03: Twelve stored advances from Jan 31 - cadence settles on 28
    // =========================================================================
    #[test]
    fn test_year_of_stored_advances() {
        let mut due = datetime!(2026-01-31 00:00 UTC);
        for _ in 0..12 {
            due = add_months(due, 1);
        }
        // First hop clamps to the 28th; every later hop preserves it.
        assert_eq!(due, datetime!(2027-01-28 00:00 UTC));
    }

    // =========================================================================
    // PTS-SM04: Multi-month hop across the year boundary with a clamp
    // =========================================================================
    #[test]
    fn test_dec_31_plus_two_months() {
        let next = add_months(datetime!(2025-12-31 17:30 UTC), 2);
        assert_eq!(next, datetime!(2026-02-28 17:30 UTC));
    }
}

#[cfg(test)]
mod signature_window_tests {
    use crate::error::PointsError;
    use crate::webhooks::{sign_payload, verify_signature};
    use time::OffsetDateTime;

    const SECRET: &str = "whsec_edge_case_secret";

    fn now_ms() -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }

    // =========================================================================
    // PTS-WS01: Skew exactly at the 300s tolerance - still accepted
    // =========================================================================
    #[test]
    fn test_exact_tolerance_boundary_accepted() {
        let body = b"{}";
        // A hair under the boundary; the exact edge races the wall clock.
        let ts = now_ms() - (300_000 - 2_000);
        let sig = sign_payload(SECRET, ts, body).unwrap();
        assert!(verify_signature(SECRET, &ts.to_string(), body, &sig).is_ok());
    }

    // =========================================================================
    // PTS-WS02: Whitespace around the headers - trimmed before use
    // =========================================================================
    #[test]
    fn test_header_whitespace_tolerated() {
        let body = b"{}";
        let ts = now_ms();
        let sig = sign_payload(SECRET, ts, body).unwrap();

        let padded_ts = format!("  {ts} ");
        let padded_sig = format!(" {sig}\n");
        assert!(verify_signature(SECRET, &padded_ts, body, &padded_sig).is_ok());
    }

    // =========================================================================
    // PTS-WS03: Wrong secret - invalid signature, not a staleness error
    // =========================================================================
    #[test]
    fn test_wrong_secret_classified_as_invalid() {
        let body = b"{}";
        let ts = now_ms();
        let sig = sign_payload("whsec_other", ts, body).unwrap();
        assert!(matches!(
            verify_signature(SECRET, &ts.to_string(), body, &sig),
            Err(PointsError::SignatureInvalid)
        ));
    }

    // =========================================================================
    // PTS-WS04: Timestamp is bound into the MAC - same body, different sig
    // =========================================================================
    #[test]
    fn test_timestamp_changes_signature() {
        let body = b"{}";
        let ts = now_ms();
        let a = sign_payload(SECRET, ts, body).unwrap();
        let b = sign_payload(SECRET, ts + 1, body).unwrap();
        assert_ne!(a, b, "Signature must commit to the timestamp");
    }
}

#[cfg(test)]
mod event_envelope_tests {
    use crate::error::PointsError;
    use crate::events::{from_epoch_millis, PaynowEvent, PaynowEventType};

    // =========================================================================
    // PTS-EV01: Unknown event type - preserved verbatim for the error path
    // =========================================================================
    #[test]
    fn test_unknown_event_type_preserved() {
        let raw = serde_json::json!({
            "id": "evt_x",
            "event_type": "refund.created",
            "data": {},
        });
        let event = PaynowEvent::from_value(raw).unwrap();
        match event.kind() {
            PaynowEventType::Unknown(t) => assert_eq!(t, "refund.created"),
            other => panic!("Expected Unknown, got {other:?}"),
        }
    }

    // =========================================================================
    // PTS-EV02: Missing data section - order() fails with InvalidPayload
    // =========================================================================
    #[test]
    fn test_missing_order_section_rejected() {
        let raw = serde_json::json!({
            "id": "evt_y",
            "event_type": "order.completed",
            "data": {"subscription": {"id": "sub_1", "product_id": "p"}},
        });
        let event = PaynowEvent::from_value(raw).unwrap();
        assert!(matches!(event.order(), Err(PointsError::InvalidPayload(_))));
    }

    // =========================================================================
    // PTS-EV03: Epoch-millis conversion - known value and overflow
    // =========================================================================
    #[test]
    fn test_epoch_millis_conversion() {
        let t = from_epoch_millis(1_700_000_000_000).unwrap();
        assert_eq!(t.year(), 2023);
        assert_eq!(t.unix_timestamp(), 1_700_000_000);

        assert!(from_epoch_millis(i64::MAX).is_none());
    }

    // =========================================================================
    // PTS-EV04: Metadata user_id honored only when it is a string
    // =========================================================================
    #[test]
    fn test_metadata_user_id_must_be_string() {
        let raw = serde_json::json!({
            "id": "evt_z",
            "event_type": "order.completed",
            "data": {"order": {
                "id": "ord_1",
                "customer": {"id": "cus_1", "metadata": {"user_id": 42}},
                "lines": [],
            }},
        });
        let event = PaynowEvent::from_value(raw).unwrap();
        let order = event.order().unwrap();
        let customer = order.customer.unwrap();
        assert_eq!(customer.metadata_user_id(), None);
    }
}

#[cfg(test)]
mod risk_scoring_tests {
    use crate::risk::{evaluate, CreditProposal, WindowSnapshot};
    use crate::types::LedgerKind;
    use qalam_shared::VelocityLimits;
    use time::OffsetDateTime;

    fn proposal(amount: i64, kind: LedgerKind) -> CreditProposal {
        CreditProposal {
            user_id: "u_edge".into(),
            amount,
            kind,
            action_id: "edge:1".into(),
            source: serde_json::json!({}),
            expires_at: None,
            provider_customer_id: None,
            ip: None,
            account_created_at: None,
            created_by: "test".into(),
        }
    }

    // =========================================================================
    // PTS-RS01: Sum landing exactly on the hourly cap - posts clean
    // =========================================================================
    #[test]
    fn test_exactly_at_hourly_cap_is_clean() {
        let limits = VelocityLimits::default();
        let snap = WindowSnapshot {
            hourly_sum: 150,
            daily_sum: 150,
            ..Default::default()
        };
        let eval = evaluate(&proposal(50, LedgerKind::Purchase), &snap, &limits, OffsetDateTime::now_utc());
        assert_eq!(eval.score, 0);
        assert!(eval.reasons.is_empty());
    }

    // =========================================================================
    // PTS-RS02: One point over the cap - held, reason names the ceiling
    // =========================================================================
    #[test]
    fn test_one_point_over_cap_holds() {
        let limits = VelocityLimits::default();
        let snap = WindowSnapshot {
            hourly_sum: 151,
            daily_sum: 151,
            ..Default::default()
        };
        let eval = evaluate(&proposal(50, LedgerKind::Purchase), &snap, &limits, OffsetDateTime::now_utc());
        assert!(eval.score as u32 >= limits.hold_threshold);
        assert!(eval.reasons[0].contains("201"), "Reason should carry the sum");
        assert!(eval.reasons[0].contains("200"), "Reason should carry the cap");
    }

    // =========================================================================
    // PTS-RS03: Promo-redemption rule ignores non-promo kinds
    // =========================================================================
    #[test]
    fn test_promo_rule_skips_purchases() {
        let limits = VelocityLimits::default();
        let snap = WindowSnapshot {
            daily_promo_count: 10,
            ..Default::default()
        };
        let eval = evaluate(&proposal(10, LedgerKind::Purchase), &snap, &limits, OffsetDateTime::now_utc());
        assert_eq!(eval.score, 0, "Purchases should not trip the promo cap");

        let eval = evaluate(&proposal(10, LedgerKind::PromoCredit), &snap, &limits, OffsetDateTime::now_utc());
        assert!(eval.score > 0, "Promo credits should trip the promo cap");
    }

    // =========================================================================
    // PTS-RS04: Each tripped rule adds its own reason
    // =========================================================================
    #[test]
    fn test_stacked_rules_stack_reasons() {
        let limits = VelocityLimits::default();
        let snap = WindowSnapshot {
            hourly_sum: 500,
            daily_sum: 1_000,
            ip_hourly_sum: 1_000,
            ..Default::default()
        };
        let mut p = proposal(100, LedgerKind::Purchase);
        p.ip = Some("203.0.113.9".into());

        let eval = evaluate(&p, &snap, &limits, OffsetDateTime::now_utc());
        assert_eq!(eval.reasons.len(), 3, "hourly, daily, and ip rules all fire");
        assert_eq!(eval.score, 60 + 60 + 50);
    }
}
