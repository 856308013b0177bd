//! # 缓存模块
//!
//! 键值存储（内存 / Redis）、缓存键规范与实体读缓存

pub mod keys;
pub mod model_cache;
pub mod store;

pub use keys::CacheKey;
pub use model_cache::ModelCache;
pub use store::{KvStore, MemoryStore, RedisStore};

use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::Result;
use crate::linfo;
use crate::logging::{LogComponent, LogStage};

/// 按配置创建存储：配置了 Redis 则连接并 PING，否则使用内存存储
pub async fn connect(config: &RedisConfig) -> Result<KvStore> {
    match config.url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => {
            let store =
                RedisStore::connect(url, Duration::from_secs(config.connect_timeout.max(1))).await?;
            linfo!(
                "system",
                LogStage::Startup,
                LogComponent::Cache,
                "redis_connected",
                "Redis 已连接"
            );
            Ok(KvStore::Redis(store))
        }
        None => {
            linfo!(
                "system",
                LogStage::Startup,
                LogComponent::Cache,
                "memory_cache",
                "未配置 Redis，使用内存存储"
            );
            Ok(KvStore::memory())
        }
    }
}
