//! # 实体读缓存
//!
//! 令牌、用户、分组的写穿透缓存，数据库为准

use std::sync::Arc;
use std::time::Duration;

use entity::tokens;

use super::{CacheKey, KvStore};
use crate::config::SharedOptions;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;
use crate::repository::Repository;

/// 实体读缓存
#[derive(Debug, Clone)]
pub struct ModelCache {
    kv: Arc<KvStore>,
    repo: Repository,
    options: Arc<SharedOptions>,
}

impl ModelCache {
    #[must_use]
    pub const fn new(kv: Arc<KvStore>, repo: Repository, options: Arc<SharedOptions>) -> Self {
        Self { kv, repo, options }
    }

    fn ttl(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.options.snapshot().sync_frequency.max(1)))
    }

    /// 缓存写入失败只记录日志
    async fn store_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) {
        if let Err(e) = self.kv.set_json(key, value, self.ttl()).await {
            lwarn!(
                "system",
                LogStage::Cache,
                LogComponent::Cache,
                "cache_write_failed",
                "写入缓存失败",
                key = key,
                error = %e
            );
        }
    }

    pub async fn token_by_key(&self, key: &str) -> Result<Option<tokens::Model>> {
        let cache_key = CacheKey::Token(key).build();
        if let Ok(Some(token)) = self.kv.get_json::<tokens::Model>(&cache_key).await {
            return Ok(Some(token));
        }
        let token = self.repo.token_by_key(key).await?;
        if let Some(token) = &token {
            self.store_json(&cache_key, token).await;
        }
        Ok(token)
    }

    pub async fn invalidate_token(&self, key: &str) -> Result<()> {
        self.kv.del(&CacheKey::Token(key).build()).await
    }

    pub async fn user_group(&self, user_id: i32) -> Result<String> {
        let cache_key = CacheKey::UserGroup(user_id).build();
        if let Ok(Some(group)) = self.kv.get(&cache_key).await {
            return Ok(group);
        }
        let group = self.repo.user_group(user_id).await?;
        if let Err(e) = self.kv.set(&cache_key, &group, self.ttl()).await {
            lwarn!("system", LogStage::Cache, LogComponent::Cache, "cache_write_failed", "写入缓存失败", key = %cache_key, error = %e);
        }
        Ok(group)
    }

    pub async fn user_enabled(&self, user_id: i32) -> Result<bool> {
        let cache_key = CacheKey::UserEnabled(user_id).build();
        if let Ok(Some(flag)) = self.kv.get(&cache_key).await {
            return Ok(flag == "1");
        }
        let enabled = self.repo.user_enabled(user_id).await?;
        let flag = if enabled { "1" } else { "0" };
        if let Err(e) = self.kv.set(&cache_key, flag, self.ttl()).await {
            lwarn!("system", LogStage::Cache, LogComponent::Cache, "cache_write_failed", "写入缓存失败", key = %cache_key, error = %e);
        }
        Ok(enabled)
    }

    /// 缓存值不高于预扣额度时回源，避免基于过期值放行
    pub async fn user_quota(&self, user_id: i32) -> Result<i64> {
        let cache_key = CacheKey::UserQuota(user_id).build();
        let pre_consumed = self.options.snapshot().pre_consumed_quota;
        if let Ok(Some(raw)) = self.kv.get(&cache_key).await {
            if let Ok(quota) = raw.parse::<i64>() {
                if quota > pre_consumed {
                    return Ok(quota);
                }
            }
        }
        self.refresh_user_quota(user_id).await
    }

    /// 从数据库刷新用户额度缓存
    pub async fn refresh_user_quota(&self, user_id: i32) -> Result<i64> {
        let quota = self.repo.user_quota(user_id).await?;
        let cache_key = CacheKey::UserQuota(user_id).build();
        if let Err(e) = self.kv.set(&cache_key, &quota.to_string(), self.ttl()).await {
            lwarn!("system", LogStage::Cache, LogComponent::Cache, "cache_write_failed", "写入缓存失败", key = %cache_key, error = %e);
        }
        Ok(quota)
    }

    /// 扣减缓存中的用户额度；缓存未命中时不创建条目
    pub async fn decrease_user_quota(&self, user_id: i32, quota: i64) -> Result<()> {
        let cache_key = CacheKey::UserQuota(user_id).build();
        if self.kv.exists(&cache_key).await? {
            self.kv.decr_by(&cache_key, quota).await?;
        }
        Ok(())
    }

    pub async fn group_models(&self, group: &str) -> Result<Vec<String>> {
        let cache_key = CacheKey::GroupModels(group).build();
        if let Ok(Some(models)) = self.kv.get_json::<Vec<String>>(&cache_key).await {
            return Ok(models);
        }
        let models = self.repo.group_models(group).await?;
        self.store_json(&cache_key, &models).await;
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;

    #[tokio::test]
    async fn test_user_quota_refreshes_when_low() {
        let harness = TestHarness::new().await;
        let user = harness.seed_user("alice", "default", 10_000).await;
        let cache = harness.context.model_cache.clone();

        assert_eq!(cache.user_quota(user.id).await.unwrap(), 10_000);
        cache.decrease_user_quota(user.id, 1_000).await.unwrap();
        assert_eq!(cache.user_quota(user.id).await.unwrap(), 9_000);

        // 低于预扣额度的缓存值会回源
        cache.decrease_user_quota(user.id, 8_800).await.unwrap();
        assert_eq!(cache.user_quota(user.id).await.unwrap(), 10_000);
    }

    #[tokio::test]
    async fn test_token_cached_after_first_read() {
        let harness = TestHarness::new().await;
        let user = harness.seed_user("bob", "default", 10_000).await;
        let token = harness.seed_token(user.id, "cachedkey", 500).await;
        let cache = harness.context.model_cache.clone();

        let first = cache.token_by_key("cachedkey").await.unwrap().unwrap();
        assert_eq!(first.id, token.id);
        let raw = harness.context.kv.get("token:cachedkey").await.unwrap();
        assert!(raw.is_some());
        cache.invalidate_token("cachedkey").await.unwrap();
        assert!(harness.context.kv.get("token:cachedkey").await.unwrap().is_none());
        assert!(cache.token_by_key("missing").await.unwrap().is_none());
    }
}
