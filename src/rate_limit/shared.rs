//! # 共享滑动窗口限流
//!
//! 列表 `rateLimit:<mark>_<subject>` 头部为最新请求时间（毫秒精度 RFC3339）

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

use super::RateDecision;
use crate::cache::{CacheKey, KvStore};
use crate::error::{ProxyError, Result};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// 多实例共享的限流器
#[derive(Debug, Clone)]
pub struct SharedRateLimiter {
    kv: Arc<KvStore>,
}

fn format_time(now: DateTime<Utc>) -> String {
    now.format(TIME_FORMAT).to_string()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| ProxyError::rate_limit_with_source(format!("无法解析限流时间戳: {raw}"), e))
}

impl SharedRateLimiter {
    #[must_use]
    pub const fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    /// 以给定时间执行一次判定
    pub async fn check_at(
        &self,
        mark: &str,
        subject: &str,
        limit: u32,
        duration: i64,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let key = CacheKey::RateLimit { mark, subject }.build();
        let ttl = Duration::from_secs(u64::try_from(duration).unwrap_or(0));
        let limit = i64::from(limit);
        let len = self.kv.llen(&key).await?;

        if len < limit {
            self.kv.lpush(&key, &format_time(now)).await?;
            self.kv.expire(&key, ttl).await?;
            return Ok(RateDecision::Pass);
        }

        let tail = self.kv.lindex(&key, -1).await?.unwrap_or_default();
        let oldest = parse_time(&tail)?;
        let elapsed = (now - oldest).num_seconds();

        if elapsed < duration || (elapsed > duration && len - 1 > limit) {
            if elapsed > duration && len - 1 > limit {
                self.kv.ltrim(&key, 0, limit - 1).await?;
            }
            self.kv.expire(&key, ttl).await?;
            return Ok(RateDecision::Reject {
                limit,
                used: len,
                remaining: limit - len,
            });
        }

        self.kv.lpush(&key, &format_time(now)).await?;
        if elapsed > duration {
            // 尾部已过期，仅保留最新的 limit-1 条
            let keep = (limit - 1).max(1);
            self.kv.ltrim(&key, 0, keep - 1).await?;
        }
        self.kv.expire(&key, ttl).await?;
        Ok(RateDecision::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    #[test]
    fn test_time_format_round_trip() {
        let now = at(5);
        assert_eq!(format_time(now), "2023-11-14T22:13:25.000Z");
        assert_eq!(parse_time(&format_time(now)).unwrap(), now);
    }

    #[tokio::test]
    async fn test_reject_within_window() {
        let limiter = SharedRateLimiter::new(Arc::new(KvStore::memory()));
        for t in [0, 1] {
            assert!(limiter.check_at("RALAY", "k_m", 2, 60, at(t)).await.unwrap().is_pass());
        }
        let decision = limiter.check_at("RALAY", "k_m", 2, 60, at(30)).await.unwrap();
        assert_eq!(
            decision,
            RateDecision::Reject {
                limit: 2,
                used: 2,
                remaining: 0
            }
        );
    }

    #[tokio::test]
    async fn test_expired_tail_is_trimmed() {
        let kv = Arc::new(KvStore::memory());
        let limiter = SharedRateLimiter::new(kv.clone());
        for t in [0, 10, 20] {
            assert!(limiter.check_at("RALAY", "k_m", 3, 60, at(t)).await.unwrap().is_pass());
        }

        // 尾部已超出窗口：裁到 2 条后写入
        assert!(limiter.check_at("RALAY", "k_m", 3, 60, at(70)).await.unwrap().is_pass());
        assert_eq!(kv.llen("rateLimit:RALAY_k_m").await.unwrap(), 2);
        assert!(limiter.check_at("RALAY", "k_m", 3, 60, at(70)).await.unwrap().is_pass());
        assert_eq!(kv.llen("rateLimit:RALAY_k_m").await.unwrap(), 3);

        // 最早的存活条目为 t=20
        let decision = limiter.check_at("RALAY", "k_m", 3, 60, at(71)).await.unwrap();
        assert_eq!(
            decision,
            RateDecision::Reject {
                limit: 3,
                used: 3,
                remaining: 0
            }
        );
    }
}
