//! Sliding-window velocity counters for the risk engine.
//!
//! Single-instance deployments use the in-memory backend; multi-instance
//! deployments point every replica at Redis so the rolling windows are
//! shared and one instance cannot be used to sidestep another's limits.

use std::collections::HashMap;
use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum VelocityError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Entries older than the largest rule window are dropped. The widest
/// velocity window is one day; keep a little slack past it.
const RETENTION: Duration = Duration::hours(25);
const RETENTION_SECS: i64 = 25 * 60 * 60;

type MemoryWindows = Arc<RwLock<HashMap<String, Vec<(OffsetDateTime, i64)>>>>;

/// Rolling-window counter store keyed by an opaque string
/// (e.g. `user:{uid}`, `ip:{addr}`, `promo:{uid}`).
#[derive(Clone)]
pub struct VelocityStore {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Memory(MemoryWindows),
    Redis(redis::aio::ConnectionManager),
}

impl VelocityStore {
    /// In-process store. Windows are per instance.
    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(RwLock::new(HashMap::new()))),
        }
    }

    /// Redis-backed store shared by all instances.
    pub async fn connect_redis(url: &str) -> Result<Self, VelocityError> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            backend: Backend::Redis(manager),
        })
    }

    /// Record an observation of `amount` under `key` at time `at`.
    pub async fn record(
        &self,
        key: &str,
        amount: i64,
        at: OffsetDateTime,
    ) -> Result<(), VelocityError> {
        match &self.backend {
            Backend::Memory(map) => {
                let floor = OffsetDateTime::now_utc() - RETENTION;
                let mut map = map.write().await;
                let window = map.entry(key.to_string()).or_default();
                window.retain(|(ts, _)| *ts >= floor);
                window.push((at, amount));
                Ok(())
            }
            Backend::Redis(manager) => {
                use redis::AsyncCommands;
                let redis_key = format!("velocity:{key}");
                // Member must be unique per observation; the amount rides
                // along in the member so sums do not need a second lookup.
                let member = format!("{}:{}:{}", at.unix_timestamp_nanos(), Uuid::new_v4(), amount);
                let floor = (OffsetDateTime::now_utc() - RETENTION).unix_timestamp();
                let mut conn = manager.clone();
                let _: () = conn.zadd(&redis_key, member, at.unix_timestamp()).await?;
                let _: () = conn.zrembyscore(&redis_key, 0, floor).await?;
                let _: () = conn.expire(&redis_key, RETENTION_SECS).await?;
                Ok(())
            }
        }
    }

    /// Sum of amounts recorded under `key` within the trailing `window`.
    pub async fn sum_since(&self, key: &str, window: Duration) -> Result<i64, VelocityError> {
        let cutoff = OffsetDateTime::now_utc() - window;
        match &self.backend {
            Backend::Memory(map) => {
                let map = map.read().await;
                Ok(map
                    .get(key)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|(ts, _)| *ts >= cutoff)
                            .map(|(_, amount)| amount)
                            .sum()
                    })
                    .unwrap_or(0))
            }
            Backend::Redis(manager) => {
                use redis::AsyncCommands;
                let redis_key = format!("velocity:{key}");
                let mut conn = manager.clone();
                let members: Vec<String> = conn
                    .zrangebyscore(&redis_key, cutoff.unix_timestamp(), "+inf")
                    .await?;
                Ok(members
                    .iter()
                    .map(|m| {
                        m.rsplit(':')
                            .next()
                            .and_then(|s| s.parse::<i64>().ok())
                            .unwrap_or(0)
                    })
                    .sum())
            }
        }
    }

    /// Number of observations recorded under `key` within the trailing `window`.
    pub async fn count_since(&self, key: &str, window: Duration) -> Result<i64, VelocityError> {
        let cutoff = OffsetDateTime::now_utc() - window;
        match &self.backend {
            Backend::Memory(map) => {
                let map = map.read().await;
                Ok(map
                    .get(key)
                    .map(|entries| entries.iter().filter(|(ts, _)| *ts >= cutoff).count() as i64)
                    .unwrap_or(0))
            }
            Backend::Redis(manager) => {
                use redis::AsyncCommands;
                let redis_key = format!("velocity:{key}");
                let mut conn = manager.clone();
                let count: i64 = conn
                    .zcount(&redis_key, cutoff.unix_timestamp(), "+inf")
                    .await?;
                Ok(count)
            }
        }
    }
}
