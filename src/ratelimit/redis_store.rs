//! Redis implementation of the shared store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::store::{AtomicAdmit, AtomicOutcome, SharedStore};
use crate::error::StoreError;

/// Trim, count, then add if below the ceiling, in one server-side step.
///
/// Returns `{1, count}` when the event was added and `{0, earliest}` when
/// the set was already full.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_start = tonumber(ARGV[2])
local max_events = tonumber(ARGV[3])
local member = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. window_start)
local count = redis.call('ZCARD', key)
if count >= max_events then
    local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local earliest = now
    if first[2] then
        earliest = tonumber(first[2])
    end
    return {0, earliest}
end
redis.call('ZADD', key, now, member)
redis.call('EXPIRE', key, ttl)
return {1, count + 1}
"#;

/// A [`SharedStore`] backed by Redis sorted sets.
///
/// The connection is established on first use and re-established by the
/// connection manager afterwards, so an unreachable server at startup only
/// shows up as per-call store errors.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    admit_script: Script,
}

impl RedisStore {
    /// Create a store for `url` without connecting.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        info!("Redis store configured");
        Ok(Self {
            client,
            connection: OnceCell::new(),
            admit_script: Script::new(ADMIT_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to Redis");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(conn.clone())
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn remove_before(&self, key: &str, min_score: u64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", min_score))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn earliest(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        let first: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(first.first().map(|(_, score)| *score as u64))
    }

    async fn add(&self, key: &str, score: u64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn add_expiring(
        &self,
        key: &str,
        score: u64,
        member: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        // -2: no such key, -1: no expiry
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(ttl).ok())
    }

    async fn admit_atomic(
        &self,
        key: &str,
        request: AtomicAdmit<'_>,
    ) -> Result<AtomicOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let (added, value): (i64, u64) = self
            .admit_script
            .key(key)
            .arg(request.now)
            .arg(request.window_start)
            .arg(request.max_events)
            .arg(request.member)
            .arg(request.ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(if added == 1 {
            AtomicOutcome::Added { count: value }
        } else {
            AtomicOutcome::Full { earliest: value }
        })
    }
}
