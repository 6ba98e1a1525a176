pub mod in_memory;
pub mod redis_backend;

use std::{
    fmt,
    net::IpAddr,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    config::{PerMinuteLimits, QuotaConfig},
    error::{GatewayError, GatewayResult},
    registry::{ClientRecord, Plan},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaTier {
    Global,
    ClientHourly,
    ClientPerMinute,
    /// IP-keyed floor applied in place of the hourly tier when no client is known.
    Anonymous,
}

impl QuotaTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::ClientHourly => "client_hourly",
            Self::ClientPerMinute => "client_per_minute",
            Self::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for QuotaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowSpec {
    pub window_seconds: u64,
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone)]
pub struct QuotaDenial {
    pub tier: QuotaTier,
    pub limit: u64,
    pub window_seconds: u64,
    pub plan: Option<Plan>,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: u64,
    pub upgrade_hint: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum QuotaError {
    #[error("global rate limit exceeded")]
    GlobalExceeded(QuotaDenial),
    #[error("hourly quota exceeded")]
    HourlyExceeded(QuotaDenial),
    #[error("per-minute analysis limit exceeded")]
    PerMinuteExceeded(QuotaDenial),
}

impl QuotaError {
    fn from_denial(denial: QuotaDenial) -> Self {
        match denial.tier {
            QuotaTier::Global => Self::GlobalExceeded(denial),
            QuotaTier::ClientHourly | QuotaTier::Anonymous => Self::HourlyExceeded(denial),
            QuotaTier::ClientPerMinute => Self::PerMinuteExceeded(denial),
        }
    }

    pub fn denial(&self) -> &QuotaDenial {
        match self {
            Self::GlobalExceeded(d) | Self::HourlyExceeded(d) | Self::PerMinuteExceeded(d) => d,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::GlobalExceeded(_) => "global_rate_limit_exceeded",
            Self::HourlyExceeded(_) => "hourly_quota_exceeded",
            Self::PerMinuteExceeded(_) => "analysis_rate_limit_exceeded",
        }
    }
}

/// Window counter store. Implementations must make check-and-increment atomic per key.
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check_and_increment(
        &self,
        tier: QuotaTier,
        key: &str,
        window: WindowSpec,
        now: DateTime<Utc>,
    ) -> GatewayResult<QuotaDecision>;

    async fn evict_idle(&self, _now: DateTime<Utc>) -> usize {
        0
    }
}

pub trait LimitResolver: Send + Sync {
    fn limit(&self, tier: QuotaTier, client: Option<&ClientRecord>) -> u64;

    /// Limit a fresh client on `plan` would get; used for upgrade hints.
    fn limit_for_plan(&self, tier: QuotaTier, plan: Plan) -> u64;
}

#[derive(Debug, Clone)]
pub struct PlanLimits {
    pub global: u64,
    pub anonymous_hourly: u64,
    pub per_minute: PerMinuteLimits,
}

impl PlanLimits {
    pub fn from_config(cfg: &QuotaConfig) -> Self {
        Self {
            global: cfg.global_limit,
            anonymous_hourly: cfg.anonymous_hourly_limit,
            per_minute: cfg.per_minute.clone(),
        }
    }
}

impl LimitResolver for PlanLimits {
    fn limit(&self, tier: QuotaTier, client: Option<&ClientRecord>) -> u64 {
        let limit = match (tier, client) {
            (QuotaTier::Global, _) => self.global,
            (QuotaTier::ClientHourly, Some(client)) => client.hourly_quota,
            (QuotaTier::ClientPerMinute, Some(client)) => self.per_minute.for_plan(client.plan),
            (QuotaTier::ClientHourly | QuotaTier::ClientPerMinute, None)
            | (QuotaTier::Anonymous, _) => self.anonymous_hourly,
        };
        limit.max(1)
    }

    fn limit_for_plan(&self, tier: QuotaTier, plan: Plan) -> u64 {
        match tier {
            QuotaTier::Global => self.global,
            QuotaTier::ClientHourly => plan.default_hourly_quota(),
            QuotaTier::ClientPerMinute => self.per_minute.for_plan(plan),
            QuotaTier::Anonymous => self.anonymous_hourly,
        }
    }
}

/// What a single request is subject to.
#[derive(Debug, Clone, Copy)]
pub struct QuotaRequest<'a> {
    pub client_ip: Option<IpAddr>,
    pub client: Option<&'a ClientRecord>,
    pub apply_global: bool,
    pub apply_per_minute: bool,
}

#[derive(Clone)]
pub struct QuotaLimiter {
    backend: Arc<dyn QuotaBackend>,
    resolver: Arc<dyn LimitResolver>,
    global_window_seconds: u64,
}

impl QuotaLimiter {
    pub fn new(
        backend: Arc<dyn QuotaBackend>,
        resolver: Arc<dyn LimitResolver>,
        global_window_seconds: u64,
    ) -> Self {
        Self {
            backend,
            resolver,
            global_window_seconds: global_window_seconds.max(1),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn window_seconds(&self, tier: QuotaTier) -> u64 {
        match tier {
            QuotaTier::Global => self.global_window_seconds,
            QuotaTier::ClientHourly | QuotaTier::Anonymous => 3_600,
            QuotaTier::ClientPerMinute => 60,
        }
    }

    pub async fn check_and_increment(
        &self,
        tier: QuotaTier,
        key: &str,
        limit: u64,
        now: DateTime<Utc>,
    ) -> GatewayResult<QuotaDecision> {
        let window = WindowSpec {
            window_seconds: self.window_seconds(tier),
            limit,
        };
        self.backend.check_and_increment(tier, key, window, now).await
    }

    pub async fn enforce(&self, request: QuotaRequest<'_>) -> GatewayResult<QuotaDecision> {
        self.enforce_at(request, Utc::now()).await
    }

    /// Runs Global, then hourly (or the anonymous floor), then per-minute.
    /// The first denial stops the sequence so later tiers are never incremented.
    /// Returns the hourly-tier decision for response headers.
    pub async fn enforce_at(
        &self,
        request: QuotaRequest<'_>,
        now: DateTime<Utc>,
    ) -> GatewayResult<QuotaDecision> {
        let ip_key = request
            .client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        if request.apply_global {
            self.run_tier(QuotaTier::Global, &ip_key, request.client, now)
                .await?;
        }

        let hourly = match request.client {
            Some(client) => {
                self.run_tier(QuotaTier::ClientHourly, &client.client_id, Some(client), now)
                    .await?
            }
            None => self.run_tier(QuotaTier::Anonymous, &ip_key, None, now).await?,
        };

        if request.apply_per_minute
            && let Some(client) = request.client
        {
            self.run_tier(QuotaTier::ClientPerMinute, &client.client_id, Some(client), now)
                .await?;
        }

        Ok(hourly)
    }

    pub async fn evict_idle(&self) -> usize {
        self.backend.evict_idle(Utc::now()).await
    }

    async fn run_tier(
        &self,
        tier: QuotaTier,
        key: &str,
        client: Option<&ClientRecord>,
        now: DateTime<Utc>,
    ) -> GatewayResult<QuotaDecision> {
        let limit = self.resolver.limit(tier, client);
        let decision = self.check_and_increment(tier, key, limit, now).await?;
        if decision.allowed {
            return Ok(decision);
        }

        let plan = client.map(|c| c.plan);
        let denial = QuotaDenial {
            tier,
            limit: decision.limit,
            window_seconds: self.window_seconds(tier),
            plan,
            reset_at: decision.reset_at,
            retry_after_secs: decision.retry_after_secs,
            upgrade_hint: match tier {
                QuotaTier::ClientHourly | QuotaTier::ClientPerMinute => {
                    plan.map(|plan| self.upgrade_hint(tier, plan))
                }
                QuotaTier::Anonymous => {
                    Some("Authenticate with an API key for a higher quota".to_string())
                }
                QuotaTier::Global => None,
            },
        };
        Err(GatewayError::QuotaExceeded(QuotaError::from_denial(denial)))
    }

    fn upgrade_hint(&self, tier: QuotaTier, plan: Plan) -> String {
        let Some(next) = plan.next() else {
            return "Contact sales to raise enterprise limits".to_string();
        };
        let limit = self.resolver.limit_for_plan(tier, next);
        match tier {
            QuotaTier::ClientPerMinute => {
                format!("Upgrade to the {next} plan for {limit} analyses per minute")
            }
            _ => format!("Upgrade to the {next} plan for {limit} requests per hour"),
        }
    }
}

pub(crate) fn retry_after_secs(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1_000).max(1)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use chrono::Duration;

    use super::*;
    use crate::{
        ratelimit::in_memory::InMemoryQuotaBackend,
        registry::test_client,
    };

    fn limiter(global: u64) -> QuotaLimiter {
        let resolver = PlanLimits {
            global,
            anonymous_hourly: 10,
            per_minute: PerMinuteLimits::default(),
        };
        QuotaLimiter::new(
            Arc::new(InMemoryQuotaBackend::new()),
            Arc::new(resolver),
            900,
        )
    }

    fn request<'a>(client: Option<&'a ClientRecord>, per_minute: bool) -> QuotaRequest<'a> {
        QuotaRequest {
            client_ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            client,
            apply_global: true,
            apply_per_minute: per_minute,
        }
    }

    fn denial(err: GatewayError) -> QuotaError {
        match err {
            GatewayError::QuotaExceeded(q) => q,
            other => panic!("expected quota denial, got {other:?}"),
        }
    }

    #[test]
    fn resolver_uses_plan_table_and_client_quota() {
        let resolver = PlanLimits {
            global: 100,
            anonymous_hourly: 10,
            per_minute: PerMinuteLimits::default(),
        };
        let client = test_client("k", "c", Plan::Premium);
        assert_eq!(resolver.limit(QuotaTier::Global, None), 100);
        assert_eq!(resolver.limit(QuotaTier::ClientHourly, Some(&client)), 1_000);
        assert_eq!(resolver.limit(QuotaTier::ClientPerMinute, Some(&client)), 20);
        assert_eq!(resolver.limit(QuotaTier::Anonymous, None), 10);
    }

    #[tokio::test]
    async fn sandbox_client_gets_exactly_fifty_requests_per_hour() {
        let limiter = limiter(1_000);
        let client = test_client("k", "sandbox-co", Plan::Sandbox);
        let start = Utc::now();

        for i in 0..50 {
            let at = start + Duration::seconds(i * 60);
            assert!(limiter.enforce_at(request(Some(&client), false), at).await.is_ok());
        }

        let err = limiter
            .enforce_at(request(Some(&client), false), start + Duration::minutes(59))
            .await
            .unwrap_err();
        let err = denial(err);
        assert!(matches!(err, QuotaError::HourlyExceeded(_)));
        assert_eq!(err.denial().limit, 50);
        assert_eq!(err.denial().plan, Some(Plan::Sandbox));
        assert!(err.denial().upgrade_hint.as_deref().unwrap().contains("basic"));
    }

    #[tokio::test]
    async fn window_resets_exactly_at_boundary() {
        let limiter = limiter(100);
        let start = Utc::now();
        let first = limiter
            .check_and_increment(QuotaTier::ClientPerMinute, "c", 1, start)
            .await
            .unwrap();
        assert!(first.allowed);

        let just_before = start + Duration::milliseconds(59_999);
        let denied = limiter
            .check_and_increment(QuotaTier::ClientPerMinute, "c", 1, just_before)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, start + Duration::seconds(60));
        assert_eq!(denied.retry_after_secs, 1);

        let at_boundary = limiter
            .check_and_increment(QuotaTier::ClientPerMinute, "c", 1, start + Duration::seconds(60))
            .await
            .unwrap();
        assert!(at_boundary.allowed);
    }

    #[tokio::test]
    async fn denial_short_circuits_later_tiers() {
        let limiter = limiter(1);
        let client = test_client("k", "acme", Plan::Basic);
        let now = Utc::now();

        limiter.enforce_at(request(Some(&client), true), now).await.unwrap();
        let err = denial(
            limiter
                .enforce_at(request(Some(&client), true), now)
                .await
                .unwrap_err(),
        );
        assert!(matches!(err, QuotaError::GlobalExceeded(_)));
        assert!(err.denial().upgrade_hint.is_none());

        // Only the first request reached the hourly tier.
        let hourly = limiter
            .check_and_increment(QuotaTier::ClientHourly, "acme", 200, now)
            .await
            .unwrap();
        assert_eq!(hourly.remaining, 198);
    }

    #[tokio::test]
    async fn per_minute_tier_applies_only_when_requested() {
        let limiter = limiter(1_000);
        let client = test_client("k", "sb", Plan::Sandbox);
        let now = Utc::now();

        for _ in 0..2 {
            limiter.enforce_at(request(Some(&client), true), now).await.unwrap();
        }
        let err = denial(
            limiter
                .enforce_at(request(Some(&client), true), now)
                .await
                .unwrap_err(),
        );
        assert!(matches!(err, QuotaError::PerMinuteExceeded(_)));
        assert_eq!(err.denial().limit, 2);
        assert!(err.denial().upgrade_hint.as_deref().unwrap().contains("5 analyses"));

        assert!(limiter.enforce_at(request(Some(&client), false), now).await.is_ok());
    }

    #[tokio::test]
    async fn anonymous_callers_share_an_ip_floor() {
        let limiter = limiter(1_000);
        let now = Utc::now();
        for _ in 0..10 {
            limiter.enforce_at(request(None, false), now).await.unwrap();
        }
        let err = denial(limiter.enforce_at(request(None, false), now).await.unwrap_err());
        assert_eq!(err.denial().tier, QuotaTier::Anonymous);
        assert_eq!(err.denial().limit, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_requests_never_overcount_or_undercount() {
        let limiter = limiter(10_000);
        let mut client = test_client("k", "burst", Plan::Basic);
        client.hourly_quota = 37;
        let client = Arc::new(client);

        let mut handles = Vec::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                limiter.enforce(request(Some(client.as_ref()), false)).await.is_ok()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 37);
    }
}
