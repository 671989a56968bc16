use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_MAX_ENTRIES: usize = 10_000;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_ms: u64,
}

impl RateDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at_ms: 0,
        }
    }

    pub fn retry_after_seconds(&self) -> u64 {
        let now = now_epoch_ms();
        self.reset_at_ms.saturating_sub(now).div_ceil(1000).max(1)
    }
}

#[derive(Debug)]
struct Window {
    count: u64,
    reset_at_ms: u64,
    last_seen_ms: u64,
}

/// Fixed-window counter keyed by caller identity. Per-process only; under
/// concurrent bursts on the same key the count can overshoot the limit by a
/// small margin, so the limit is soft.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    windows: Arc<DashMap<String, Window>>,
    last_cleanup_epoch: Arc<AtomicU64>,
    max_entries: usize,
    cleanup_interval: Duration,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, CLEANUP_INTERVAL)
    }

    fn with_limits(max_entries: usize, cleanup_interval: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            last_cleanup_epoch: Arc::new(AtomicU64::new(0)),
            max_entries,
            cleanup_interval,
        }
    }

    /// A `limit` of zero disables the limiter for the key.
    pub fn consume(&self, key: &str, limit: u64, window: Duration) -> RateDecision {
        if limit == 0 {
            return RateDecision::unlimited();
        }
        let now = now_epoch_ms();
        self.maybe_cleanup(now);
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at_ms: 0,
            last_seen_ms: now,
        });
        let window_ms = window.as_millis().min(u64::MAX as u128) as u64;
        let state = entry.value_mut();
        state.last_seen_ms = now;
        if now >= state.reset_at_ms {
            state.count = 1;
            state.reset_at_ms = now + window_ms;
            return RateDecision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(1),
                reset_at_ms: state.reset_at_ms,
            };
        }
        if state.count < limit {
            state.count += 1;
            return RateDecision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(state.count),
                reset_at_ms: state.reset_at_ms,
            };
        }
        RateDecision {
            allowed: false,
            limit,
            remaining: 0,
            reset_at_ms: state.reset_at_ms,
        }
    }

    pub fn consume_ip(&self, ip: IpAddr, limit: u64, window: Duration) -> RateDecision {
        self.consume(&format!("ip:{ip}"), limit, window)
    }

    /// Keeps the window map bounded. Expired windows are swept once the map
    /// crosses the size threshold; if that is not enough the least recently
    /// seen keys are dropped.
    fn maybe_cleanup(&self, now: u64) {
        if self.windows.len() <= self.max_entries {
            return;
        }
        if !self.should_cleanup(now) {
            return;
        }
        self.windows.retain(|_, window| now < window.reset_at_ms);
        if self.windows.len() > self.max_entries {
            let mut entries = self
                .windows
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().last_seen_ms))
                .collect::<Vec<_>>();
            entries.sort_by_key(|(_, last_seen)| *last_seen);
            let overflow = entries.len().saturating_sub(self.max_entries);
            for (key, _) in entries.into_iter().take(overflow) {
                self.windows.remove(&key);
            }
        }
    }

    fn should_cleanup(&self, now_ms: u64) -> bool {
        let now = now_ms / 1000;
        let last = self.last_cleanup_epoch.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.cleanup_interval.as_secs() {
            return false;
        }
        self.last_cleanup_epoch
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_allows_up_to_limit_then_denies() {
        let limiter = FixedWindowLimiter::new();
        let window = Duration::from_secs(60);
        let decisions: Vec<_> = (0..4)
            .map(|_| limiter.consume("caller", 3, window))
            .collect();
        assert_eq!(
            decisions.iter().map(|d| d.allowed).collect::<Vec<_>>(),
            vec![true, true, true, false]
        );
        assert_eq!(decisions[0].remaining, 2);
        assert_eq!(decisions[2].remaining, 0);
        assert_eq!(decisions[3].remaining, 0);
        assert!(decisions[3].reset_at_ms > now_epoch_ms());
    }

    #[test]
    fn expired_window_reinitializes() {
        let limiter = FixedWindowLimiter::new();
        // A zero-length window expires immediately, so every call lands in a
        // fresh window with count = 1.
        let window = Duration::from_millis(0);
        for _ in 0..5 {
            let decision = limiter.consume("caller", 1, window);
            assert!(decision.allowed);
        }
    }

    #[test]
    fn distinct_keys_have_independent_windows() {
        let limiter = FixedWindowLimiter::new();
        let window = Duration::from_secs(60);
        assert!(limiter.consume("a", 1, window).allowed);
        assert!(!limiter.consume("a", 1, window).allowed);
        assert!(limiter.consume("b", 1, window).allowed);
    }

    #[test]
    fn zero_limit_disables_limiting() {
        let limiter = FixedWindowLimiter::new();
        for _ in 0..100 {
            assert!(
                limiter
                    .consume("caller", 0, Duration::from_secs(60))
                    .allowed
            );
        }
    }

    #[test]
    fn window_map_stays_bounded_under_many_distinct_keys() {
        let limiter = FixedWindowLimiter::with_limits(8, Duration::ZERO);
        let window = Duration::from_secs(60);
        for i in 0..100 {
            assert!(limiter.consume(&format!("caller-{i}"), 1, window).allowed);
        }
        // Cleanup runs before the new entry lands, so the map can hold at
        // most one key beyond the threshold at any point.
        assert!(limiter.tracked_keys() <= 9);
    }

    #[test]
    fn cleanup_sweeps_expired_windows_and_keeps_live_ones() {
        let limiter = FixedWindowLimiter::with_limits(4, Duration::ZERO);
        for i in 0..4 {
            limiter.consume(&format!("stale-{i}"), 1, Duration::ZERO);
        }
        let live = Duration::from_secs(60);
        limiter.consume("live-a", 1, live);
        limiter.consume("live-b", 1, live);
        // The stale windows were swept, so live-a's count survived intact.
        assert!(!limiter.consume("live-a", 1, live).allowed);
        assert!(limiter.tracked_keys() <= 4);
    }

    #[test]
    fn denial_reports_positive_retry_after() {
        let limiter = FixedWindowLimiter::new();
        let window = Duration::from_secs(60);
        limiter.consume("caller", 1, window);
        let denied = limiter.consume("caller", 1, window);
        assert!(!denied.allowed);
        let retry = denied.retry_after_seconds();
        assert!(retry >= 1 && retry <= 60);
    }
}
