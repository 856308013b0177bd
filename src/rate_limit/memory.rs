//! # 内存滑动窗口限流
//!
//! 每个键保存最近 `limit` 次请求的时间，分片锁

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::RateDecision;

#[derive(Debug)]
struct Window {
    hits: VecDeque<Instant>,
    last_seen: Instant,
}

/// 单进程限流器
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    store: DashMap<String, Window>,
    expiration: Duration,
}

impl InMemoryRateLimiter {
    #[must_use]
    pub fn new(expiration_secs: u64) -> Self {
        Self {
            store: DashMap::new(),
            expiration: Duration::from_secs(expiration_secs.max(1)),
        }
    }

    pub fn request(&self, key: &str, limit: u32, duration: i64) -> RateDecision {
        self.request_at(key, limit, duration, Instant::now())
    }

    pub fn request_at(&self, key: &str, limit: u32, duration: i64, now: Instant) -> RateDecision {
        let limit = limit as usize;
        let window_len = Duration::from_secs(u64::try_from(duration).unwrap_or(0));
        let mut window = self.store.entry(key.to_string()).or_insert_with(|| Window {
            hits: VecDeque::with_capacity(limit),
            last_seen: now,
        });
        window.last_seen = now;

        if window.hits.len() < limit {
            window.hits.push_back(now);
            return RateDecision::Pass;
        }
        let oldest_expired = window
            .hits
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= window_len);
        if oldest_expired {
            window.hits.pop_front();
            window.hits.push_back(now);
            RateDecision::Pass
        } else {
            let used = window.hits.len() as i64;
            RateDecision::Reject {
                limit: limit as i64,
                used,
                remaining: limit as i64 - used,
            }
        }
    }

    /// 清除超过过期时间未访问的键
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.store.len();
        self.store
            .retain(|_, window| now.saturating_duration_since(window.last_seen) < self.expiration);
        before - self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sliding_window() {
        let limiter = InMemoryRateLimiter::new(180);
        let t0 = Instant::now();
        for i in 0..3 {
            assert!(limiter.request_at("GA1.1.1.1", 3, 60, t0 + Duration::from_secs(i)).is_pass());
        }
        assert!(!limiter.request_at("GA1.1.1.1", 3, 60, t0 + Duration::from_secs(30)).is_pass());
        // 最早的一次已滑出窗口
        assert!(limiter.request_at("GA1.1.1.1", 3, 60, t0 + Duration::from_secs(60)).is_pass());
        assert!(!limiter.request_at("GA1.1.1.1", 3, 60, t0 + Duration::from_secs(60)).is_pass());
        // 其他键互不影响
        assert!(limiter.request_at("GA2.2.2.2", 3, 60, t0).is_pass());
    }

    #[test]
    fn test_expired_head_is_trimmed_one_at_a_time() {
        let limiter = InMemoryRateLimiter::new(180);
        let t0 = Instant::now();
        for secs in [0, 10, 20] {
            assert!(limiter.request_at("RALAYk_gpt-4o", 3, 60, t0 + Duration::from_secs(secs)).is_pass());
        }
        let t70 = t0 + Duration::from_secs(70);
        assert!(limiter.request_at("RALAYk_gpt-4o", 3, 60, t70).is_pass());
        assert!(limiter.request_at("RALAYk_gpt-4o", 3, 60, t70).is_pass());
        assert_eq!(
            limiter.request_at("RALAYk_gpt-4o", 3, 60, t70),
            RateDecision::Reject {
                limit: 3,
                used: 3,
                remaining: 0
            }
        );
    }
}
