// Points crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Ledger adjustments and report rows carry many columns
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Qalam Points Module
//!
//! Points ledger and PayNow webhook reconciliation for the Qalam platform.
//!
//! ## Features
//!
//! - **Ledger**: paid/promo wallet with expiring promo lots and an
//!   append-only entry log
//! - **Spending**: soonest-expiry-first promo drain, then paid balance
//! - **Webhooks**: signed PayNow ingress with atomic event claims
//! - **Queue**: push-subscription processing with terminal/transient
//!   failure classification
//! - **Subscriptions**: monthly cycle credits for month and year plans
//! - **Risk**: velocity scoring that holds suspect credits for review
//! - **Reconciliation**: nightly wallet-vs-ledger drift correction

pub mod customers;
pub mod error;
pub mod events;
pub mod ledger;
pub mod queue;
pub mod reconcile;
pub mod risk;
pub mod subscriptions;
pub mod types;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Customers
pub use customers::{CustomerDirectory, ResolvedUser};

// Error
pub use error::{PointsError, PointsResult};

// Events
pub use events::{
    DeliveryItemData, OrderData, OrderLine, PaynowCustomer, PaynowEvent, PaynowEventType,
    SubscriptionData,
};

// Ledger
pub use ledger::{CreditParams, LedgerStore, SpendParams};

// Queue
pub use queue::{PushDisposition, PushEnvelope, PushMessage, QueueProcessor, QueuedWebhookJob};

// Reconciliation
pub use reconcile::{ReconcileOutcome, ReconciliationJob, ReconciliationSummary};

// Risk
pub use risk::{
    CreditProposal, GateOutcome, ResolutionOutcome, RiskEngine, RiskEvent, RiskResolution,
};

// Subscriptions
pub use subscriptions::{
    SubscriptionChange, SubscriptionEventParams, SubscriptionRow, SubscriptionService,
    SweepSummary,
};

// Types
pub use types::{
    CreditOutcome, LedgerEntry, LedgerKind, PromoLot, SpendOutcome, SpendPreview, Wallet,
    WalletBalance,
};

// Webhooks
pub use webhooks::{
    sign_payload, verify_signature, IngestOutcome, ProcessOutcome, ReplaySummary, WebhookEventRow,
    WebhookHandler,
};

use std::sync::Arc;

use sqlx::PgPool;

use qalam_shared::{PointsConfig, VelocityStore};

/// Main points service that combines all points functionality
pub struct PointsService {
    pub ledger: LedgerStore,
    pub customers: CustomerDirectory,
    pub risk: RiskEngine,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub queue: QueueProcessor,
    pub reconciliation: ReconciliationJob,
}

impl PointsService {
    pub fn new(pool: PgPool, config: Arc<PointsConfig>, velocity: VelocityStore) -> Self {
        let ledger = LedgerStore::new(pool.clone(), config.allow_negative_balance);
        let customers = CustomerDirectory::new(pool.clone());
        let risk = RiskEngine::new(
            pool.clone(),
            ledger.clone(),
            velocity,
            config.velocity.clone(),
            config.risk_holds_enabled,
        );
        let subscriptions = SubscriptionService::new(pool.clone(), ledger.clone(), config.clone());
        let webhooks = WebhookHandler::new(
            pool,
            config.clone(),
            customers.clone(),
            risk.clone(),
            subscriptions.clone(),
        );
        let queue = QueueProcessor::new(config, webhooks.clone());
        let reconciliation = ReconciliationJob::new(ledger.clone());

        Self {
            ledger,
            customers,
            risk,
            subscriptions,
            webhooks,
            queue,
            reconciliation,
        }
    }
}
