//! # 额度核算
//!
//! 请求前按上限预扣，响应后按实际用量多退少补并写用量日志

use std::sync::Arc;

use axum::http::StatusCode;

use super::batch::{BatchKind, BatchUpdater};
use super::notifier::{Notifier, send_once};
use crate::auth::AuthContext;
use crate::cache::{KvStore, ModelCache};
use crate::config::SharedOptions;
use crate::error::{ProxyError, RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::repository::{Repository, UsageLogRecord};
use crate::{ldebug, lerror, lwarn};

/// 用户额度充足时跳过持久化预扣的倍数
const TRUSTED_QUOTA_MULTIPLE: i64 = 100;

pub const QUOTA_REMIND_SUBJECT: &str = "Your quota is about to run out";
pub const QUOTA_EXHAUSTED_SUBJECT: &str = "Your quota has been used up";

/// 文本请求的最终额度：总 token 为 0 时不计费，倍率非零时至少为 1
#[must_use]
pub fn text_quota(prompt_tokens: i64, completion_tokens: i64, completion_ratio: f64, ratio: f64) -> i64 {
    if prompt_tokens + completion_tokens == 0 {
        return 0;
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let quota = ((completion_tokens as f64).mul_add(completion_ratio, prompt_tokens as f64) * ratio).ceil() as i64;
    if ratio != 0.0 && quota <= 0 { 1 } else { quota }
}

/// 用量日志中的倍率说明
#[must_use]
pub fn consume_log_content(
    model_ratio: f64,
    group_ratio: f64,
    completion_ratio: f64,
    system_prompt_reset: bool,
) -> String {
    let mut content =
        format!("模型倍率 {model_ratio:.2}，分组倍率 {group_ratio:.2}，补全倍率 {completion_ratio:.2}");
    if system_prompt_reset {
        content.push_str(" （注意系统提示词已被重置）");
    }
    content
}

/// 一次请求的结算数据
#[derive(Debug, Clone, Default)]
pub struct UsageCharge {
    pub request_id: String,
    pub user_id: i32,
    pub token_id: i32,
    pub token_name: String,
    pub channel_id: i32,
    pub model_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub pre_consumed: i64,
    pub content: String,
    pub elapsed_ms: i64,
    pub first_response_ms: i64,
    pub is_stream: bool,
}

/// 额度核算器
#[derive(Debug, Clone)]
pub struct QuotaAccountant {
    repo: Repository,
    cache: ModelCache,
    options: Arc<SharedOptions>,
    kv: Arc<KvStore>,
    notifier: Arc<dyn Notifier>,
    batch: Option<Arc<BatchUpdater>>,
}

impl QuotaAccountant {
    #[must_use]
    pub fn new(
        repo: Repository,
        cache: ModelCache,
        options: Arc<SharedOptions>,
        kv: Arc<KvStore>,
        notifier: Arc<dyn Notifier>,
        batch: Option<Arc<BatchUpdater>>,
    ) -> Self {
        Self {
            repo,
            cache,
            options,
            kv,
            notifier,
            batch,
        }
    }

    async fn shift_token(&self, id: i32, delta: i64) -> Result<()> {
        match &self.batch {
            Some(batch) => {
                batch.add(BatchKind::TokenQuota, id, delta);
                Ok(())
            }
            None => self.repo.shift_token_quota(id, delta).await,
        }
    }

    async fn shift_user(&self, id: i32, delta: i64) -> Result<()> {
        match &self.batch {
            Some(batch) => {
                batch.add(BatchKind::UserQuota, id, delta);
                Ok(())
            }
            None => self.repo.shift_user_quota(id, delta).await,
        }
    }

    /// 额度跨过提醒阈值或用尽时通知用户；发送失败只记录
    async fn remind(&self, user_id: i32, user_quota: i64, quota: i64) {
        let threshold = self.options.snapshot().quota_remind_threshold;
        let remain = user_quota - quota;
        let subject = if remain <= 0 {
            QUOTA_EXHAUSTED_SUBJECT
        } else if user_quota >= threshold && remain < threshold {
            QUOTA_REMIND_SUBJECT
        } else {
            return;
        };
        let email = match self.repo.user_by_id(user_id).await {
            Ok(Some(user)) => user.email.unwrap_or_default(),
            Ok(None) => return,
            Err(e) => {
                lwarn!("system", LogStage::Billing, LogComponent::Billing, "remind_lookup_failed", "查询用户邮箱失败", user_id = user_id, error = %e);
                return;
            }
        };
        let content = format!("您的额度剩余 {remain}，请及时充值以免影响使用。");
        if let Err(e) = send_once(&self.kv, self.notifier.as_ref(), &email, subject, &content).await {
            lerror!("system", LogStage::Billing, LogComponent::Billing, "remind_mail_failed", "额度提醒发送失败", user_id = user_id, error = %e);
        }
    }

    /// 预扣令牌与用户额度
    pub async fn pre_consume_token_quota(&self, token_id: i32, quota: i64) -> Result<()> {
        crate::ensure!(quota >= 0, Validation, "quota 不能为负数！");
        let token = self
            .repo
            .token_by_id(token_id)
            .await?
            .ok_or_else(|| ProxyError::quota(format!("token {token_id} not found")))?;
        if !token.unlimited_quota && token.remain_quota < quota {
            return Err(ProxyError::quota("token quota is not enough"));
        }
        let user_quota = self.repo.user_quota(token.user_id).await?;
        if user_quota < quota {
            return Err(ProxyError::quota("user quota is not enough"));
        }
        self.remind(token.user_id, user_quota, quota).await;
        if !token.unlimited_quota {
            self.shift_token(token_id, -quota).await?;
        }
        self.shift_user(token.user_id, -quota).await
    }

    /// 按符号补扣或退还
    pub async fn post_consume_token_quota(&self, token_id: i32, delta: i64) -> Result<()> {
        let token = self
            .repo
            .token_by_id(token_id)
            .await?
            .ok_or_else(|| ProxyError::quota(format!("token {token_id} not found")))?;
        self.shift_user(token.user_id, -delta).await?;
        if !token.unlimited_quota {
            self.shift_token(token_id, -delta).await?;
        }
        Ok(())
    }

    /// 请求前预扣；`ratio` 为模型倍率与分组倍率之积
    pub async fn pre_consume(
        &self,
        auth: &AuthContext,
        request_id: &str,
        prompt_tokens: i64,
        max_tokens: i64,
        ratio: f64,
    ) -> std::result::Result<PreConsumed, RelayError> {
        let base = self.options.snapshot().pre_consumed_quota;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let mut quota = ((base + prompt_tokens + max_tokens) as f64 * ratio).ceil() as i64;

        let user_quota = self
            .cache
            .user_quota(auth.user_id)
            .await
            .map_err(|e| RelayError::wrap(e, "get_user_quota_failed", StatusCode::INTERNAL_SERVER_ERROR))?;
        if user_quota < quota {
            return Err(RelayError::wrap("user quota is not enough", "insufficient_user_quota", StatusCode::FORBIDDEN));
        }
        self.cache
            .decrease_user_quota(auth.user_id, quota)
            .await
            .map_err(|e| RelayError::wrap(e, "decrease_user_quota_failed", StatusCode::INTERNAL_SERVER_ERROR))?;

        if user_quota > TRUSTED_QUOTA_MULTIPLE * quota {
            ldebug!(request_id, LogStage::Billing, LogComponent::Billing, "pre_consume_trusted", "用户额度充足，跳过预扣", user_id = auth.user_id, user_quota = user_quota);
            quota = 0;
        } else if quota > 0 {
            self.pre_consume_token_quota(auth.token_id, quota)
                .await
                .map_err(|e| RelayError::wrap(e.message(), "pre_consume_token_quota_failed", StatusCode::FORBIDDEN))?;
        }
        Ok(PreConsumed {
            accountant: self.clone(),
            token_id: auth.token_id,
            request_id: request_id.to_string(),
            quota,
            armed: true,
        })
    }

    /// 结算：多退少补、刷新缓存、写日志与累计用量
    pub async fn settle(&self, charge: UsageCharge) -> Result<()> {
        let delta = charge.quota - charge.pre_consumed;
        if delta != 0 {
            self.post_consume_token_quota(charge.token_id, delta).await?;
        }
        if let Err(e) = self.cache.refresh_user_quota(charge.user_id).await {
            lwarn!(&charge.request_id, LogStage::Billing, LogComponent::Billing, "refresh_user_quota_failed", "刷新用户额度缓存失败", error = %e);
        }
        if charge.quota == 0 {
            return Ok(());
        }

        let (user_id, channel_id, quota) = (charge.user_id, charge.channel_id, charge.quota);
        self.repo
            .record_consume_log(UsageLogRecord {
                user_id,
                channel_id,
                token_id: charge.token_id,
                token_name: charge.token_name,
                model_name: charge.model_name,
                prompt_tokens: i32::try_from(charge.prompt_tokens).unwrap_or(i32::MAX),
                completion_tokens: i32::try_from(charge.completion_tokens).unwrap_or(i32::MAX),
                quota,
                content: charge.content,
                elapsed_ms: charge.elapsed_ms,
                first_response_ms: charge.first_response_ms,
                is_stream: charge.is_stream,
                request_id: charge.request_id,
            })
            .await?;
        match &self.batch {
            Some(batch) => {
                batch.add(BatchKind::UserUsedQuota, user_id, quota);
                batch.add(BatchKind::RequestCount, user_id, 1);
                batch.add(BatchKind::ChannelUsedQuota, channel_id, quota);
            }
            None => {
                self.repo
                    .update_user_used_quota_and_request_count(user_id, quota, 1)
                    .await?;
                self.repo.update_channel_used_quota(channel_id, quota).await?;
            }
        }
        Ok(())
    }
}

/// 预扣凭据；未结算即被丢弃时在后台退还
#[derive(Debug)]
pub struct PreConsumed {
    accountant: QuotaAccountant,
    token_id: i32,
    request_id: String,
    quota: i64,
    armed: bool,
}

impl PreConsumed {
    #[must_use]
    pub const fn quota(&self) -> i64 {
        self.quota
    }

    /// 转入结算流程，返回已预扣的额度
    #[must_use]
    pub fn settle(mut self) -> i64 {
        self.armed = false;
        self.quota
    }

    /// 立即退还
    pub async fn refund(mut self) -> Result<()> {
        self.armed = false;
        if self.quota == 0 {
            return Ok(());
        }
        self.accountant
            .post_consume_token_quota(self.token_id, -self.quota)
            .await
    }
}

impl Drop for PreConsumed {
    fn drop(&mut self) {
        if !self.armed || self.quota == 0 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            lerror!(&self.request_id, LogStage::Billing, LogComponent::Billing, "refund_skipped", "没有运行时，无法退还预扣额度", quota = self.quota);
            return;
        };
        let accountant = self.accountant.clone();
        let (token_id, quota, request_id) = (self.token_id, self.quota, self.request_id.clone());
        handle.spawn(async move {
            if let Err(e) = accountant.post_consume_token_quota(token_id, -quota).await {
                lerror!(&request_id, LogStage::Billing, LogComponent::Billing, "refund_failed", "退还预扣额度失败", token_id = token_id, quota = quota, error = %e);
            }
        });
    }
}
