use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::{
    error::GatewayResult,
    ratelimit::{QuotaBackend, QuotaDecision, QuotaTier, WindowSpec, retry_after_secs},
};

/// Fixed-window counters in a sharded map. The shard write lock held by
/// `entry()` makes reset, compare and increment one step per key.
pub struct InMemoryQuotaBackend {
    windows: DashMap<(QuotaTier, String), FixedWindow>,
}

#[derive(Debug)]
struct FixedWindow {
    window_start: DateTime<Utc>,
    duration: Duration,
    count: u64,
    last_seen: DateTime<Utc>,
}

impl FixedWindow {
    fn new(now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            window_start: now,
            duration,
            count: 0,
            last_seen: now,
        }
    }

    fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + self.duration
    }
}

impl InMemoryQuotaBackend {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl QuotaBackend for InMemoryQuotaBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check_and_increment(
        &self,
        tier: QuotaTier,
        key: &str,
        window: WindowSpec,
        now: DateTime<Utc>,
    ) -> GatewayResult<QuotaDecision> {
        let duration = Duration::seconds(window.window_seconds as i64);
        let mut entry = self
            .windows
            .entry((tier, key.to_string()))
            .or_insert_with(|| FixedWindow::new(now, duration));
        let state = entry.value_mut();

        if now >= state.reset_at() {
            state.window_start = now;
            state.count = 0;
        }
        state.duration = duration;
        state.last_seen = now;

        let reset_at = state.reset_at();
        if state.count < window.limit {
            state.count += 1;
            Ok(QuotaDecision {
                allowed: true,
                limit: window.limit,
                remaining: window.limit - state.count,
                reset_at,
                retry_after_secs: 0,
            })
        } else {
            Ok(QuotaDecision {
                allowed: false,
                limit: window.limit,
                remaining: 0,
                reset_at,
                retry_after_secs: retry_after_secs(reset_at, now),
            })
        }
    }

    async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, state| now < state.last_seen + state.duration);
        before.saturating_sub(self.windows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(limit: u64) -> WindowSpec {
        WindowSpec {
            window_seconds: 60,
            limit,
        }
    }

    #[tokio::test]
    async fn counts_down_remaining_then_denies() {
        let backend = InMemoryQuotaBackend::new();
        let now = Utc::now();

        let first = backend
            .check_and_increment(QuotaTier::ClientHourly, "a", window(2), now)
            .await
            .unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = backend
            .check_and_increment(QuotaTier::ClientHourly, "a", window(2), now)
            .await
            .unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = backend
            .check_and_increment(QuotaTier::ClientHourly, "a", window(2), now + Duration::seconds(30))
            .await
            .unwrap();
        assert!(!third.allowed);
        assert_eq!(third.retry_after_secs, 30);
        assert_eq!(third.reset_at, now + Duration::seconds(60));
    }

    #[tokio::test]
    async fn tiers_and_keys_are_independent() {
        let backend = InMemoryQuotaBackend::new();
        let now = Utc::now();

        assert!(
            backend
                .check_and_increment(QuotaTier::ClientHourly, "a", window(1), now)
                .await
                .unwrap()
                .allowed
        );
        assert!(
            backend
                .check_and_increment(QuotaTier::ClientPerMinute, "a", window(1), now)
                .await
                .unwrap()
                .allowed
        );
        assert!(
            backend
                .check_and_increment(QuotaTier::ClientHourly, "b", window(1), now)
                .await
                .unwrap()
                .allowed
        );
        assert!(
            !backend
                .check_and_increment(QuotaTier::ClientHourly, "a", window(1), now)
                .await
                .unwrap()
                .allowed
        );
    }

    #[tokio::test]
    async fn evicts_only_idle_windows() {
        let backend = InMemoryQuotaBackend::new();
        let start = Utc::now();

        backend
            .check_and_increment(QuotaTier::ClientPerMinute, "idle", window(5), start)
            .await
            .unwrap();
        backend
            .check_and_increment(
                QuotaTier::ClientPerMinute,
                "busy",
                window(5),
                start + Duration::seconds(50),
            )
            .await
            .unwrap();

        let evicted = backend.evict_idle(start + Duration::seconds(61)).await;
        assert_eq!(evicted, 1);
        assert_eq!(backend.len(), 1);
    }
}
