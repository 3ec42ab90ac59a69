//! Error types for the points core.
//!
//! Every failure crossing the crate boundary is one of these variants; raw
//! storage errors never escape. The queue worker and webhook ingress use
//! [`PointsError::is_terminal`] to decide between acknowledging a message
//! (stop retrying) and returning a retryable status.

use uuid::Uuid;

pub type PointsResult<T> = Result<T, PointsError>;

#[derive(Debug, thiserror::Error)]
pub enum PointsError {
    /// A spend exceeds the available balance and negative balances are
    /// disabled. Never retryable.
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: i64, available: i64 },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Signature did not match the payload. Rejected before any record is
    /// written so a corrected resend can succeed.
    #[error("webhook signature invalid")]
    SignatureInvalid,

    /// Timestamp header outside the replay-protection window.
    #[error("webhook timestamp outside freshness window")]
    StaleTimestamp,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Product id has no configured point mapping.
    #[error("unknown product: {0}")]
    UnknownProduct(String),

    /// No user could be resolved from metadata, customer mapping, or email.
    #[error("could not resolve user: {0}")]
    UserNotResolved(String),

    /// Queue message written by a schema older than we can read.
    #[error("message schema version {got} below minimum {min}")]
    SchemaTooOld { got: u32, min: u32 },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("database error: {0}")]
    Storage(String),

    /// Contention or connectivity failure; the caller's delivery mechanism
    /// should retry.
    #[error("transient storage error: {0}")]
    TransientStorage(String),
}

impl PointsError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PointsError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn not_found_uuid(kind: &'static str, id: Uuid) -> Self {
        PointsError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Terminal failures will never succeed on retry; the delivery channel
    /// should be acknowledged and the event marked `failed_terminal`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PointsError::InsufficientBalance { .. }
                | PointsError::InvalidAmount(_)
                | PointsError::InvalidPayload(_)
                | PointsError::UnknownProduct(_)
                | PointsError::UserNotResolved(_)
                | PointsError::SchemaTooOld { .. }
                | PointsError::NotFound { .. }
        )
    }
}

impl From<sqlx::Error> for PointsError {
    fn from(e: sqlx::Error) -> Self {
        if is_retryable_conflict(&e) {
            return PointsError::TransientStorage(e.to_string());
        }
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                PointsError::TransientStorage(e.to_string())
            }
            _ => PointsError::Storage(e.to_string()),
        }
    }
}

/// Serialization failure, deadlock, or lock-not-available: safe to retry the
/// whole transaction.
pub fn is_retryable_conflict(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = e {
        if let Some(code) = db.code() {
            return code == "40001" || code == "40P01" || code == "55P03";
        }
    }
    false
}

/// Unique-constraint violation (SQLSTATE 23505). The ledger treats this on
/// `(user_id, action_id)` as an idempotent replay, not a failure.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = e {
        if let Some(code) = db.code() {
            return code == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(PointsError::UnknownProduct("prod_x".into()).is_terminal());
        assert!(PointsError::UserNotResolved("cus_1".into()).is_terminal());
        assert!(PointsError::InvalidPayload("no event type".into()).is_terminal());
        assert!(PointsError::SchemaTooOld { got: 1, min: 2 }.is_terminal());
        assert!(PointsError::InsufficientBalance {
            needed: 10,
            available: 5
        }
        .is_terminal());

        assert!(!PointsError::Storage("connection reset".into()).is_terminal());
        assert!(!PointsError::TransientStorage("serialization".into()).is_terminal());
        assert!(!PointsError::SignatureInvalid.is_terminal());
    }
}
