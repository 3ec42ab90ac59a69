//! Maps PayNow customers to application user ids.
//!
//! Resolution order: explicit `user_id` in the customer metadata, then the
//! stored provider mapping, then an email lookup against the users table.
//! Whichever path wins, the mapping is written back so later events resolve
//! without the metadata.

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{PointsError, PointsResult};
use crate::events::PaynowCustomer;

#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub user_id: String,
    /// From the users table when the row exists; the risk engine uses this
    /// for account-age checks and skips them when it is unknown.
    pub account_created_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct CustomerDirectory {
    pool: PgPool,
}

impl CustomerDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn resolve(&self, customer: &PaynowCustomer) -> PointsResult<ResolvedUser> {
        let provider_id = customer.id.as_deref();

        if let Some(user_id) = customer.metadata_user_id() {
            let user_id = user_id.to_string();
            if let Some(provider_id) = provider_id {
                self.record_mapping(provider_id, &user_id).await?;
            }
            let account_created_at = self.user_created_at(&user_id).await?;
            return Ok(ResolvedUser {
                user_id,
                account_created_at,
            });
        }

        if let Some(provider_id) = provider_id {
            let mapped: Option<(String,)> = sqlx::query_as(
                "SELECT user_id FROM provider_customers WHERE provider_customer_id = $1",
            )
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some((user_id,)) = mapped {
                let account_created_at = self.user_created_at(&user_id).await?;
                return Ok(ResolvedUser {
                    user_id,
                    account_created_at,
                });
            }
        }

        if let Some(email) = customer.email.as_deref() {
            let email = normalize_email(email);
            if !email.is_empty() {
                let row: Option<(String, Option<OffsetDateTime>)> =
                    sqlx::query_as("SELECT id, created_at FROM users WHERE LOWER(email) = $1")
                        .bind(&email)
                        .fetch_optional(&self.pool)
                        .await?;
                if let Some((user_id, account_created_at)) = row {
                    if let Some(provider_id) = provider_id {
                        self.record_mapping(provider_id, &user_id).await?;
                        tracing::info!(
                            provider_customer_id = %provider_id,
                            user_id = %user_id,
                            "Resolved customer by email and backfilled mapping"
                        );
                    }
                    return Ok(ResolvedUser {
                        user_id,
                        account_created_at,
                    });
                }
            }
        }

        let reference = customer
            .id
            .clone()
            .or_else(|| customer.email.clone())
            .unwrap_or_else(|| "<no id or email>".into());
        Err(PointsError::UserNotResolved(reference))
    }

    async fn record_mapping(&self, provider_customer_id: &str, user_id: &str) -> PointsResult<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_customers (provider_customer_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (provider_customer_id) DO NOTHING
            "#,
        )
        .bind(provider_customer_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn user_created_at(&self, user_id: &str) -> PointsResult<Option<OffsetDateTime>> {
        let row: Option<(Option<OffsetDateTime>,)> =
            sqlx::query_as("SELECT created_at FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(t,)| t))
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_normalization_trims_and_lowercases() {
        assert_eq!(normalize_email("  User@Example.COM "), "user@example.com");
        assert_eq!(normalize_email(""), "");
        assert_eq!(normalize_email("   "), "");
    }
}
