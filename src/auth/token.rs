//! # 令牌校验

use std::sync::Arc;

use entity::tokens;

use super::key::AuthUtils;
use crate::cache::{KvStore, ModelCache};
use crate::logging::{LogComponent, LogStage};
use crate::lerror;
use crate::repository::Repository;

/// 令牌状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
    Unknown,
}

impl TokenStatus {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
            Self::Expired => 3,
            Self::Exhausted => 4,
            Self::Unknown => 0,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Enabled,
            2 => Self::Disabled,
            3 => Self::Expired,
            4 => Self::Exhausted,
            _ => Self::Unknown,
        }
    }
}

/// 令牌校验器
#[derive(Debug, Clone)]
pub struct TokenValidator {
    cache: ModelCache,
    repo: Repository,
    kv: Arc<KvStore>,
}

impl TokenValidator {
    #[must_use]
    pub const fn new(cache: ModelCache, repo: Repository, kv: Arc<KvStore>) -> Self {
        Self { cache, repo, kv }
    }

    /// 校验令牌，失败时返回面向调用方的消息
    pub async fn validate_user_token(&self, key: &str) -> Result<tokens::Model, String> {
        if key.is_empty() {
            return Err("no key provided".to_string());
        }
        let token = match self.cache.token_by_key(key).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err("invalid token".to_string()),
            Err(e) => {
                lerror!(
                    "system",
                    LogStage::Authentication,
                    LogComponent::Auth,
                    "token_lookup_failed",
                    "查询令牌失败",
                    error = %e
                );
                return Err("failed to check key.".to_string());
            }
        };

        let masked = AuthUtils::mask_key(&token.key);
        let exceeded =
            format!("API Key: {masked}, You exceeded your current quota, please check your quota");
        let expired =
            format!("API Key: {masked}, Your key was expired, please check your key status");

        match TokenStatus::from_code(token.status) {
            TokenStatus::Exhausted => return Err(exceeded),
            TokenStatus::Expired => return Err(expired),
            TokenStatus::Enabled => {}
            TokenStatus::Disabled | TokenStatus::Unknown => {
                return Err(format!(
                    "API Key: {masked}, You cann't access our system, please check your key status"
                ));
            }
        }

        if token.expired_time != -1 && token.expired_time < chrono::Utc::now().timestamp() {
            self.persist_status(&token, TokenStatus::Expired).await;
            return Err(expired);
        }
        if !token.unlimited_quota && token.remain_quota <= 0 {
            self.persist_status(&token, TokenStatus::Exhausted).await;
            return Err(exceeded);
        }
        Ok(token)
    }

    /// 共享缓存下其他实例可能仍持有旧额度，只在单实例时落库
    async fn persist_status(&self, token: &tokens::Model, status: TokenStatus) {
        if self.kv.is_shared() {
            return;
        }
        if let Err(e) = self.repo.update_token_status(token.id, status.code()).await {
            lerror!(
                "system",
                LogStage::Db,
                LogComponent::Auth,
                "token_status_update_failed",
                "更新令牌状态失败",
                token_id = token.id,
                error = %e
            );
        }
        let _ = self.cache.invalidate_token(&token.key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;

    #[tokio::test]
    async fn test_validation_messages() {
        let harness = TestHarness::new().await;
        let user = harness.seed_user("carol", "default", 1_000).await;
        harness.seed_token(user.id, "goodkey12345", 100).await;
        let exhausted = harness.seed_token(user.id, "emptykey1234", 0).await;
        let validator = harness.context.token_validator.clone();

        assert_eq!(validator.validate_user_token("").await.unwrap_err(), "no key provided");
        assert_eq!(validator.validate_user_token("nope").await.unwrap_err(), "invalid token");
        assert!(validator.validate_user_token("goodkey12345").await.is_ok());

        let err = validator.validate_user_token("emptykey1234").await.unwrap_err();
        assert_eq!(
            err,
            "API Key: emp***1234, You exceeded your current quota, please check your quota"
        );
        // 单实例模式下状态会落库
        let stored = harness.context.repo.token_by_id(exhausted.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TokenStatus::Exhausted.code());
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let harness = TestHarness::new().await;
        let user = harness.seed_user("dave", "default", 1_000).await;
        let token = harness.seed_token(user.id, "oldkey123456", 100).await;
        harness.expire_token(token.id).await;
        let err = harness
            .context
            .token_validator
            .validate_user_token("oldkey123456")
            .await
            .unwrap_err();
        assert!(err.contains("Your key was expired"));
    }
}
