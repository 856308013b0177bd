//! # 渠道健康监控
//!
//! 记录成功/失败计数，并对单次失败执行休眠、删文件、禁用

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use super::policy::{should_del_file, should_disable, should_sleep};
use crate::billing::Notifier;
use crate::channel::{ChannelKind, ChannelStatus, ChannelStore, ChannelWakeupTask};
use crate::config::SharedOptions;
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::relay::meta::AdaptorHints;
use crate::repository::Repository;
use crate::{lerror, linfo, lwarn};

/// 未给出建议等待时的休眠时长（秒）
const DEFAULT_SLEEP_SECS: i64 = 60;

/// 单个渠道的调用计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelHealth {
    pub successes: u64,
    pub failures: u64,
    pub last_failure_at: Option<i64>,
}

/// 一次失败尝试的快照
#[derive(Debug, Clone)]
pub struct ChannelFailure {
    pub request_id: String,
    pub channel_id: i32,
    pub channel_name: String,
    pub channel_kind: ChannelKind,
    pub group: String,
    /// 用户请求的模型
    pub model: String,
    pub user_id: i32,
    pub token_name: String,
    pub error: RelayError,
    pub hints: AdaptorHints,
}

/// 失败处理结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureOutcome {
    pub slept: bool,
    pub file_deleted: bool,
    pub disabled: bool,
}

/// 渠道监控
pub struct ChannelMonitor {
    health: DashMap<i32, ChannelHealth>,
    pub(super) channels: Arc<ChannelStore>,
    wakeup: ChannelWakeupTask,
    pub(super) repo: Repository,
    pub(super) options: Arc<SharedOptions>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for ChannelMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMonitor")
            .field("tracked_channels", &self.health.len())
            .finish_non_exhaustive()
    }
}

impl ChannelMonitor {
    #[must_use]
    pub fn new(
        channels: Arc<ChannelStore>,
        wakeup: ChannelWakeupTask,
        repo: Repository,
        options: Arc<SharedOptions>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            health: DashMap::new(),
            channels,
            wakeup,
            repo,
            options,
            notifier,
        }
    }

    /// 记录一次调用结果
    pub fn emit(&self, channel_id: i32, success: bool) {
        let mut health = self.health.entry(channel_id).or_default();
        if success {
            health.successes += 1;
        } else {
            health.failures += 1;
            health.last_failure_at = Some(chrono::Utc::now().timestamp());
        }
    }

    #[must_use]
    pub fn health(&self, channel_id: i32) -> ChannelHealth {
        self.health.get(&channel_id).map(|h| *h).unwrap_or_default()
    }

    /// 按渠道 ID 排序的全部计数
    #[must_use]
    pub fn snapshot(&self) -> Vec<(i32, ChannelHealth)> {
        let mut rows: Vec<(i32, ChannelHealth)> =
            self.health.iter().map(|e| (*e.key(), *e.value())).collect();
        rows.sort_by_key(|(id, _)| *id);
        rows
    }

    /// 处理一次失败尝试
    pub async fn process_failure(&self, failure: ChannelFailure) -> FailureOutcome {
        let rid = failure.request_id.as_str();
        lerror!(
            rid,
            LogStage::ResponseFailure,
            LogComponent::Monitor,
            "relay_error",
            "中继失败",
            channel_id = failure.channel_id,
            user_id = failure.user_id,
            token_name = %failure.token_name,
            status = failure.error.status_code.as_u16(),
            error = %failure.error.error.message
        );
        let mut outcome = FailureOutcome::default();

        if should_sleep(failure.channel_kind, &failure.error) {
            let delay = failure
                .hints
                .gemini_delay
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_SLEEP_SECS);
            let wake_at = chrono::Utc::now().timestamp() + delay;
            self.channels
                .sleep(&failure.group, &failure.model, failure.channel_id, wake_at);
            if let Err(e) = self
                .wakeup
                .schedule(failure.channel_id, &failure.model, wake_at)
                .await
            {
                lwarn!(rid, LogStage::HealthCheck, LogComponent::Monitor, "wakeup_schedule_failed", "登记唤醒时间失败", error = %e);
            }
            outcome.slept = true;
        }

        if should_del_file(&failure.error) {
            if let Some(file_uri) = failure.hints.file_uri.as_deref() {
                match self.repo.delete_file_by_file_id(file_uri).await {
                    Ok(_) => {
                        linfo!(rid, LogStage::HealthCheck, LogComponent::Monitor, "file_deleted", "已删除失效的上传文件", channel_id = failure.channel_id, file_uri = file_uri);
                        outcome.file_deleted = true;
                    }
                    Err(e) => {
                        lwarn!(rid, LogStage::HealthCheck, LogComponent::Monitor, "file_delete_failed", "删除上传文件失败", file_uri = file_uri, error = %e);
                    }
                }
            }
        }

        let enabled = self.options.snapshot().automatic_disable_channel;
        if should_disable(&failure.error, enabled) {
            match self
                .disable(failure.channel_id, &failure.channel_name, &failure.error.error.message)
                .await
            {
                Ok(()) => outcome.disabled = true,
                Err(e) => {
                    lerror!(rid, LogStage::HealthCheck, LogComponent::Monitor, "disable_failed", "禁用渠道失败", channel_id = failure.channel_id, error = %e);
                }
            }
        } else {
            self.emit(failure.channel_id, false);
        }
        outcome
    }

    /// 自动禁用渠道并通知超级管理员
    pub async fn disable(&self, channel_id: i32, channel_name: &str, reason: &str) -> Result<()> {
        self.disable_as(channel_id, channel_name, ChannelStatus::AutoDisabled, reason)
            .await
    }

    /// 以指定状态停用渠道，重建索引后通知超级管理员
    pub async fn disable_as(
        &self,
        channel_id: i32,
        channel_name: &str,
        status: ChannelStatus,
        reason: &str,
    ) -> Result<()> {
        self.repo
            .update_channel_status(channel_id, status.code(), Some(reason))
            .await?;
        lwarn!(
            "system",
            LogStage::HealthCheck,
            LogComponent::Monitor,
            "channel_disabled",
            "渠道已被停用",
            channel_id = channel_id,
            status = status.code(),
            reason = reason
        );
        self.channels.rebuild().await?;

        let subject = format!("渠道「{channel_name}」（#{channel_id}）已被禁用");
        let content = format!("渠道「{channel_name}」（#{channel_id}）已被禁用，原因：{reason}");
        self.notify_root(&subject, &content).await;
        Ok(())
    }

    async fn notify_root(&self, subject: &str, content: &str) {
        let configured = self.options.snapshot().root_user_email.clone();
        let email = match configured.filter(|e| !e.is_empty()) {
            Some(email) => email,
            None => match self.repo.root_user_email().await {
                Ok(Some(email)) => email,
                Ok(None) => return,
                Err(e) => {
                    lwarn!("system", LogStage::HealthCheck, LogComponent::Monitor, "root_email_lookup_failed", "查询超级管理员邮箱失败", error = %e);
                    return;
                }
            },
        };
        if let Err(e) = self.notifier.send(&email, subject, content).await {
            lerror!("system", LogStage::HealthCheck, LogComponent::Notifier, "notify_root_failed", "通知超级管理员失败", error = %e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::LogNotifier;
    use crate::channel::ChannelKind;
    use crate::testing::TestHarness;
    use crate::testing::fixtures::ChannelRow;
    use axum::http::StatusCode;

    fn failure(channel_id: i32, kind: ChannelKind, error: RelayError) -> ChannelFailure {
        ChannelFailure {
            request_id: "rid".to_string(),
            channel_id,
            channel_name: "primary".to_string(),
            channel_kind: kind,
            group: "default".to_string(),
            model: "gemini-1.5-pro".to_string(),
            user_id: 1,
            token_name: "t".to_string(),
            error,
            hints: AdaptorHints::default(),
        }
    }

    #[tokio::test]
    async fn test_emit_counts() {
        let harness = TestHarness::new().await;
        let monitor = &harness.context.monitor;
        monitor.emit(4, true);
        monitor.emit(4, false);
        monitor.emit(4, true);
        let health = monitor.health(4);
        assert_eq!(health.successes, 2);
        assert_eq!(health.failures, 1);
        assert!(health.last_failure_at.is_some());
        assert_eq!(monitor.health(5), ChannelHealth::default());
    }

    #[tokio::test]
    async fn test_gemini_exhaustion_sleeps_channel() {
        let harness = TestHarness::new().await;
        let channel = harness
            .seed_channel(ChannelRow::new(ChannelKind::Gemini, "http://127.0.0.1:1", &["gemini-1.5-pro"]))
            .await;
        let mut failed = failure(
            channel.id,
            ChannelKind::Gemini,
            RelayError::new(StatusCode::TOO_MANY_REQUESTS, "Resource has been exhausted", "upstream_error", "429"),
        );
        failed.hints.gemini_delay = Some(30);

        let before = chrono::Utc::now().timestamp();
        let outcome = harness.context.monitor.process_failure(failed).await;
        assert!(outcome.slept);
        assert!(!outcome.disabled);

        let store = &harness.context.channels;
        assert!(store.is_sleeping(channel.id, "gemini-1.5-pro"));
        let entry = &store.sleeping_entries()[0];
        assert!(entry.wake_at >= before + 30 && entry.wake_at <= before + 31);
        assert!(store.select("default", "gemini-1.5-pro", false).is_none());
        assert_eq!(harness.context.monitor.health(channel.id).failures, 1);
    }

    #[tokio::test]
    async fn test_auth_failure_disables_and_notifies_root() {
        let notifier = Arc::new(LogNotifier::new());
        let harness = TestHarness::with_notifier(notifier.clone()).await;
        harness
            .context
            .options
            .update(|o| o.root_user_email = Some("root@example.com".to_string()));
        let channel = harness
            .seed_channel(ChannelRow::new(ChannelKind::OpenAi, "http://127.0.0.1:1", &["gpt-4o"]).name("main"))
            .await;

        let outcome = harness
            .context
            .monitor
            .process_failure(failure(
                channel.id,
                ChannelKind::OpenAi,
                RelayError::new(StatusCode::UNAUTHORIZED, "Incorrect API key provided", "invalid_request_error", "invalid_api_key"),
            ))
            .await;
        assert!(outcome.disabled);

        let row = harness.context.repo.channel_by_id(channel.id).await.unwrap().unwrap();
        assert_eq!(row.status, ChannelStatus::AutoDisabled.code());
        assert_eq!(row.disable_reason.as_deref(), Some("Incorrect API key provided"));
        assert!(harness.context.channels.get(channel.id).is_none());

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "root@example.com");
        assert_eq!(sent[0].subject, format!("渠道「main」（#{}）已被禁用", channel.id));
        assert!(sent[0].content.ends_with("原因：Incorrect API key provided"));
    }

    #[tokio::test]
    async fn test_stale_file_is_deleted() {
        let harness = TestHarness::new().await;
        harness
            .context
            .repo
            .insert_file("gemini-1.5-pro", "https://x/a.mp4", "files/abc", "video/mp4")
            .await
            .unwrap();
        let mut failed = failure(
            9,
            ChannelKind::Gemini,
            RelayError::new(StatusCode::FORBIDDEN, "You do not have permission to access the File files/abc", "upstream_error", "403"),
        );
        failed.hints.file_uri = Some("files/abc".to_string());

        let outcome = harness.context.monitor.process_failure(failed).await;
        assert!(outcome.file_deleted);
        let cached = harness
            .context
            .repo
            .file_by_model_url("gemini-1.5-pro", "https://x/a.mp4")
            .await
            .unwrap();
        assert!(cached.is_none());
    }
}
