//! # 令牌巡检
//!
//! 过期/耗尽状态更新，以及软限制、即将过期的提醒邮件

use std::sync::Arc;

use entity::tokens;

use super::Notifier;
use crate::auth::TokenStatus;
use crate::auth::key::AuthUtils;
use crate::cache::{CacheKey, KvStore};
use crate::config::SharedOptions;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::repository::Repository;
use crate::{linfo, lwarn};

pub const SUBJECT_EXPIRED: &str = "Key has expired";
pub const SUBJECT_HARD_LIMIT: &str = "Hard Limit Notice";
pub const SUBJECT_SOFT_LIMIT: &str = "Soft Limit Notice";
pub const SUBJECT_EXPIRING: &str = "Key Expiring Soon Notice";

/// 提前提醒过期的窗口
const EXPIRING_WINDOW_SECS: i64 = 5 * 86_400;
/// 剩余额度占比低于该值时发送软限制提醒
const SOFT_LIMIT_RATIO: f64 = 0.2;
const ALERT_SENT: i32 = 1;
const ALERT_FINAL: i32 = 2;

/// 一次状态巡检的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub exhausted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alert {
    SoftLimit,
    Expiring,
}

fn is_expired(token: &tokens::Model, now: i64) -> bool {
    token.expired_time != -1 && token.expired_time < now
}

fn is_exhausted(token: &tokens::Model) -> bool {
    !token.unlimited_quota && token.remain_quota < 0
}

fn pending_alert(token: &tokens::Model, now: i64) -> Option<Alert> {
    if token.email.as_deref().is_none_or(str::is_empty) {
        return None;
    }
    if token.hard_limit_usd > 0
        && token.exhausted_alert == 0
        && token.remain_quota as f64 / token.hard_limit_usd as f64 <= SOFT_LIMIT_RATIO
    {
        return Some(Alert::SoftLimit);
    }
    if token.expired_time != -1
        && token.expired_time <= now + EXPIRING_WINDOW_SECS
        && token.expired_alert == 0
    {
        return Some(Alert::Expiring);
    }
    None
}

fn date_of(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// 令牌巡检器
#[derive(Clone)]
pub struct TokenSweeper {
    repo: Repository,
    kv: Arc<KvStore>,
    options: Arc<SharedOptions>,
    notifier: Arc<dyn Notifier>,
}

impl TokenSweeper {
    #[must_use]
    pub fn new(
        repo: Repository,
        kv: Arc<KvStore>,
        options: Arc<SharedOptions>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            repo,
            kv,
            options,
            notifier,
        }
    }

    fn usd(&self, quota: i64) -> f64 {
        let per_unit = self.options.snapshot().quota_per_unit;
        if per_unit > 0.0 { quota as f64 / per_unit } else { 0.0 }
    }

    async fn mail(&self, token: &tokens::Model, subject: &str, content: &str) {
        let Some(email) = token.email.as_deref().filter(|e| !e.is_empty()) else {
            return;
        };
        if let Err(e) = self.notifier.send(email, subject, content).await {
            lwarn!("system", LogStage::BackgroundTask, LogComponent::Notifier, "token_mail_failed", "发送令牌通知失败", token_id = token.id, error = %e);
        }
    }

    async fn forget(&self, token: &tokens::Model) {
        if let Err(e) = self.kv.del(&CacheKey::Token(&token.key).build()).await {
            lwarn!("system", LogStage::Cache, LogComponent::Cache, "token_cache_evict_failed", "清除令牌缓存失败", token_id = token.id, error = %e);
        }
    }

    /// 启用中的令牌：已过期的标记过期，额度为负的标记耗尽
    pub async fn update_statuses(&self) -> Result<SweepReport> {
        let now = chrono::Utc::now().timestamp();
        let mut report = SweepReport::default();
        for token in self
            .repo
            .tokens_with_status(TokenStatus::Enabled.code())
            .await?
        {
            let masked = AuthUtils::mask_key(&token.key);
            if is_expired(&token, now) {
                let content = format!(
                    "Your key {masked} has expired at {}. API requests using it are now rejected.",
                    date_of(token.expired_time)
                );
                self.repo
                    .update_token_status(token.id, TokenStatus::Expired.code())
                    .await?;
                self.repo
                    .update_token_alerts(token.id, Some(ALERT_FINAL), None)
                    .await?;
                self.mail(&token, SUBJECT_EXPIRED, &content).await;
                self.forget(&token).await;
                linfo!("system", LogStage::BackgroundTask, LogComponent::Tasks, "token_expired", "令牌已过期", token_id = token.id, expired_time = token.expired_time);
                report.expired += 1;
            } else if is_exhausted(&token) {
                let content = format!(
                    "You've reached the hard limit of ${:.2} for key {masked}. API requests using it are rejected until the limit is raised.",
                    self.usd(token.hard_limit_usd)
                );
                self.repo
                    .update_token_status(token.id, TokenStatus::Exhausted.code())
                    .await?;
                self.repo
                    .update_token_alerts(token.id, None, Some(ALERT_FINAL))
                    .await?;
                self.mail(&token, SUBJECT_HARD_LIMIT, &content).await;
                self.forget(&token).await;
                linfo!("system", LogStage::BackgroundTask, LogComponent::Tasks, "token_exhausted", "令牌额度耗尽", token_id = token.id, remain_quota = token.remain_quota);
                report.exhausted += 1;
            }
        }
        Ok(report)
    }

    /// 发送软限制与即将过期提醒，每类只发一次；返回发送数量
    pub async fn send_alerts(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut sent = 0;
        for token in self
            .repo
            .tokens_with_status(TokenStatus::Enabled.code())
            .await?
        {
            let masked = AuthUtils::mask_key(&token.key);
            match pending_alert(&token, now) {
                Some(Alert::SoftLimit) => {
                    let content = format!(
                        "You've reached the soft limit of ${:.2} for key {masked}. Your hard limit is ${:.2}.",
                        self.usd(token.remain_quota),
                        self.usd(token.hard_limit_usd)
                    );
                    self.mail(&token, SUBJECT_SOFT_LIMIT, &content).await;
                    self.repo
                        .update_token_alerts(token.id, None, Some(ALERT_SENT))
                        .await?;
                }
                Some(Alert::Expiring) => {
                    let content = format!(
                        "Your key {masked} will expire on {}.",
                        date_of(token.expired_time)
                    );
                    self.mail(&token, SUBJECT_EXPIRING, &content).await;
                    self.repo
                        .update_token_alerts(token.id, Some(ALERT_SENT), None)
                        .await?;
                }
                None => continue,
            }
            sent += 1;
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::LogNotifier;
    use crate::testing::TestHarness;
    use sea_orm::{ActiveModelTrait, Set};

    fn sweeper(harness: &TestHarness, notifier: Arc<LogNotifier>) -> TokenSweeper {
        let ctx = &harness.context;
        TokenSweeper::new(ctx.repo.clone(), ctx.kv.clone(), ctx.options.clone(), notifier)
    }

    async fn patch(harness: &TestHarness, id: i32, f: impl FnOnce(&mut tokens::ActiveModel)) {
        let token = harness.context.repo.token_by_id(id).await.unwrap().unwrap();
        let mut active: tokens::ActiveModel = token.into();
        f(&mut active);
        active.update(harness.context.repo.connection()).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_and_exhausted_tokens_are_marked() {
        let notifier = Arc::new(LogNotifier::new());
        let harness = TestHarness::with_notifier(notifier.clone()).await;
        let user = harness.seed_user("alice", "default", 1000).await;
        let expired = harness.seed_token(user.id, "sk-expired-aaaaaaaa", 100).await;
        let exhausted = harness.seed_token(user.id, "sk-exhausted-bbbbbb", -5).await;
        let healthy = harness.seed_token(user.id, "sk-healthy-cccccccc", 100).await;
        patch(&harness, expired.id, |t| {
            t.expired_time = Set(chrono::Utc::now().timestamp() - 10);
            t.email = Set(Some("a@x.io".to_string()));
        })
        .await;
        patch(&harness, exhausted.id, |t| t.email = Set(Some("b@x.io".to_string()))).await;

        let report = sweeper(&harness, notifier.clone()).update_statuses().await.unwrap();
        assert_eq!(report, SweepReport { expired: 1, exhausted: 1 });

        let repo = &harness.context.repo;
        let row = repo.token_by_id(expired.id).await.unwrap().unwrap();
        assert_eq!(row.status, TokenStatus::Expired.code());
        assert_eq!(row.expired_alert, ALERT_FINAL);
        let row = repo.token_by_id(exhausted.id).await.unwrap().unwrap();
        assert_eq!(row.status, TokenStatus::Exhausted.code());
        let row = repo.token_by_id(healthy.id).await.unwrap().unwrap();
        assert_eq!(row.status, TokenStatus::Enabled.code());

        let subjects: Vec<String> = notifier.sent().into_iter().map(|m| m.subject).collect();
        assert!(subjects.contains(&SUBJECT_EXPIRED.to_string()));
        assert!(subjects.contains(&SUBJECT_HARD_LIMIT.to_string()));
    }

    #[tokio::test]
    async fn test_alerts_are_sent_once() {
        let notifier = Arc::new(LogNotifier::new());
        let harness = TestHarness::with_notifier(notifier.clone()).await;
        let user = harness.seed_user("bob", "default", 1000).await;
        let low = harness.seed_token(user.id, "sk-low-dddddddddddd", 10).await;
        let soon = harness.seed_token(user.id, "sk-soon-eeeeeeeeeee", 1000).await;
        patch(&harness, low.id, |t| {
            t.hard_limit_usd = Set(100);
            t.email = Set(Some("low@x.io".to_string()));
        })
        .await;
        patch(&harness, soon.id, |t| {
            t.expired_time = Set(chrono::Utc::now().timestamp() + 86_400);
            t.email = Set(Some("soon@x.io".to_string()));
        })
        .await;

        let sweeper = sweeper(&harness, notifier.clone());
        assert_eq!(sweeper.send_alerts().await.unwrap(), 2);
        assert_eq!(sweeper.send_alerts().await.unwrap(), 0);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        let soft = sent.iter().find(|m| m.to == "low@x.io").unwrap();
        assert_eq!(soft.subject, SUBJECT_SOFT_LIMIT);
        let expiring = sent.iter().find(|m| m.to == "soon@x.io").unwrap();
        assert_eq!(expiring.subject, SUBJECT_EXPIRING);
    }

    #[test]
    fn test_tokens_without_email_get_no_alert() {
        let token = tokens::Model {
            id: 1,
            user_id: 1,
            key: "k".to_string(),
            status: 1,
            name: "t".to_string(),
            created_time: 0,
            accessed_time: 0,
            expired_time: 10,
            remain_quota: 0,
            unlimited_quota: false,
            used_quota: 0,
            hard_limit_usd: 100,
            models: None,
            subnet: None,
            rpm_limit: 0,
            dpm_limit: 0,
            tpm_limit: 0,
            email: None,
            expired_alert: 0,
            exhausted_alert: 0,
            moderations_enable: false,
        };
        assert_eq!(pending_alert(&token, 0), None);
        let with_email = tokens::Model {
            email: Some("x@y.z".to_string()),
            ..token
        };
        assert_eq!(pending_alert(&with_email, 0), Some(Alert::SoftLimit));
    }
}
