use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::{
    Script,
    aio::ConnectionManager,
};

use crate::{
    error::GatewayResult,
    ratelimit::{QuotaBackend, QuotaDecision, QuotaTier, WindowSpec, retry_after_secs},
};

// A key without a TTL (missing or left over from a crash) starts a new window.
const FIXED_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])

local ttl = redis.call('PTTL', key)
if ttl <= 0 then
  redis.call('SET', key, 1, 'PX', window_ms)
  return {1, 1, window_ms}
end

local count = tonumber(redis.call('GET', key) or '0')
if count >= limit then
  return {0, count, ttl}
end

count = redis.call('INCR', key)
return {1, count, ttl}
"#;

pub struct RedisQuotaBackend {
    manager: ConnectionManager,
    key_prefix: String,
    script: Script,
}

impl RedisQuotaBackend {
    pub async fn new(url: String, key_prefix: String) -> GatewayResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
            script: Script::new(FIXED_WINDOW_LUA),
        })
    }

    fn key(&self, tier: QuotaTier, key: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, tier.as_str(), key)
    }
}

#[async_trait]
impl QuotaBackend for RedisQuotaBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn check_and_increment(
        &self,
        tier: QuotaTier,
        key: &str,
        window: WindowSpec,
        now: DateTime<Utc>,
    ) -> GatewayResult<QuotaDecision> {
        let mut conn = self.manager.clone();
        let window_ms = (window.window_seconds * 1_000) as i64;

        let (allowed, count, ttl_ms): (i64, i64, i64) = self
            .script
            .key(self.key(tier, key))
            .arg(window.limit as i64)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        let reset_at = now + Duration::milliseconds(ttl_ms.max(0));
        let count = count.max(0) as u64;

        Ok(if allowed == 1 {
            QuotaDecision {
                allowed: true,
                limit: window.limit,
                remaining: window.limit.saturating_sub(count),
                reset_at,
                retry_after_secs: 0,
            }
        } else {
            QuotaDecision {
                allowed: false,
                limit: window.limit,
                remaining: 0,
                reset_at,
                retry_after_secs: retry_after_secs(reset_at, now),
            }
        })
    }
}
