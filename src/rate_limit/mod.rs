//! # 限流模块
//!
//! 内存滑动窗口与基于共享键值存储的滑动窗口，初始化时二选一

pub mod memory;
pub mod middleware;
pub mod shared;

pub use memory::InMemoryRateLimiter;
pub use middleware::{global_api_rate_limit, relay_rate_limit};
pub use shared::SharedRateLimiter;

use std::sync::Arc;

use crate::cache::KvStore;
use crate::config::{RateLimitConfig, RateLimitRule};
use crate::error::Result;

/// 路由类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitClass {
    GlobalWeb,
    GlobalApi,
    Critical,
    Download,
    Upload,
    Relay,
}

impl RateLimitClass {
    /// 键前缀标记
    #[must_use]
    pub const fn mark(self) -> &'static str {
        match self {
            Self::GlobalWeb => "GW",
            Self::GlobalApi => "GA",
            Self::Critical => "CT",
            Self::Download => "DW",
            Self::Upload => "UP",
            Self::Relay => "RALAY",
        }
    }

    #[must_use]
    pub const fn rule(self, config: &RateLimitConfig) -> RateLimitRule {
        match self {
            Self::GlobalWeb => config.global_web,
            Self::GlobalApi => config.global_api,
            Self::Critical => config.critical,
            Self::Download => config.download,
            Self::Upload => config.upload,
            Self::Relay => config.relay,
        }
    }
}

/// 限流判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Pass,
    Reject {
        limit: i64,
        used: i64,
        /// 列表超出上限时可为负
        remaining: i64,
    },
}

impl RateDecision {
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// 单个键的限额：令牌 RPM 与类别配置取大，0 表示不限
#[must_use]
pub fn effective_limit(token_rpm: i32, class_num: u32) -> u32 {
    u32::try_from(token_rpm).unwrap_or(0).max(class_num)
}

/// 限流后端
#[derive(Debug)]
pub enum RateLimiter {
    Memory(InMemoryRateLimiter),
    Shared(SharedRateLimiter),
}

impl RateLimiter {
    /// 共享存储可用时使用共享后端
    #[must_use]
    pub fn for_store(kv: Arc<KvStore>, config: &RateLimitConfig) -> Self {
        if kv.is_shared() {
            Self::Shared(SharedRateLimiter::new(kv))
        } else {
            Self::Memory(InMemoryRateLimiter::new(config.memory_expiration))
        }
    }

    #[must_use]
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Shared(_) => "shared",
        }
    }

    /// `key` 为不含前缀的主体（`<apikey>_<model>` 或 IP）
    pub async fn check(
        &self,
        class: RateLimitClass,
        subject: &str,
        limit: u32,
        duration: i64,
    ) -> Result<RateDecision> {
        if limit == 0 {
            return Ok(RateDecision::Pass);
        }
        match self {
            Self::Memory(limiter) => Ok(limiter.request(
                &format!("{}{subject}", class.mark()),
                limit,
                duration,
            )),
            Self::Shared(limiter) => {
                limiter
                    .check_at(class.mark(), subject, limit, duration, chrono::Utc::now())
                    .await
            }
        }
    }

    /// 周期清理内存后端的过期键
    pub fn purge(&self) -> usize {
        match self {
            Self::Memory(limiter) => limiter.purge_expired(),
            Self::Shared(_) => 0,
        }
    }
}
