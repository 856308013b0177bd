//! # 测试数据
//!
//! 运行时渠道与各表行的默认构造

use std::collections::HashMap;

use entity::{channels, groups, tokens, users};
use sea_orm::{ActiveValue::NotSet, Set};

use crate::auth::TokenStatus;
use crate::channel::{Channel, ChannelConfig, ChannelKind, ChannelStatus};
use crate::repository::USER_STATUS_ENABLED;

/// 内存中的渠道，属于 `default` 分组
#[must_use]
pub fn channel(id: i32, kind: ChannelKind, priority: i64, models: &[&str]) -> Channel {
    Channel {
        id,
        name: format!("channel-{id}"),
        kind,
        status: ChannelStatus::Enabled,
        key: format!("sk-upstream-{id}"),
        base_url: kind.default_base_url().to_string(),
        config: ChannelConfig::default(),
        models: models.iter().map(|m| (*m).to_string()).collect(),
        groups: vec!["default".to_string()],
        priority,
        weight: 0,
        rpm_limit: 0,
        dpm_limit: 0,
        tpm_limit: 0,
        system_prompt: None,
        model_mapping: HashMap::new(),
        soft_limit_usd: 0.0,
        used_quota: 0,
    }
}

/// 渠道行构造器
#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub kind: ChannelKind,
    pub name: String,
    pub key: String,
    pub base_url: String,
    pub models: Vec<String>,
    pub group: String,
    pub priority: i64,
    pub status: ChannelStatus,
    pub config: String,
    pub model_mapping: Option<String>,
    pub system_prompt: Option<String>,
    pub soft_limit_usd: f64,
    pub used_quota: i64,
}

impl ChannelRow {
    #[must_use]
    pub fn new(kind: ChannelKind, base_url: &str, models: &[&str]) -> Self {
        Self {
            kind,
            name: format!("{kind}-channel"),
            key: "sk-upstream".to_string(),
            base_url: base_url.to_string(),
            models: models.iter().map(|m| (*m).to_string()).collect(),
            group: "default".to_string(),
            priority: 0,
            status: ChannelStatus::Enabled,
            config: "{}".to_string(),
            model_mapping: None,
            system_prompt: None,
            soft_limit_usd: 0.0,
            used_quota: 0,
        }
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn status(mut self, status: ChannelStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = Some(prompt.to_string());
        self
    }

    #[must_use]
    pub const fn soft_limit(mut self, soft_limit_usd: f64, used_quota: i64) -> Self {
        self.soft_limit_usd = soft_limit_usd;
        self.used_quota = used_quota;
        self
    }

    #[must_use]
    pub fn active_model(self) -> channels::ActiveModel {
        channels::ActiveModel {
            id: NotSet,
            channel_type: Set(self.kind.code()),
            key: Set(self.key),
            status: Set(self.status.code()),
            name: Set(self.name),
            weight: Set(0),
            created_time: Set(chrono::Utc::now().timestamp()),
            test_time: Set(0),
            response_time: Set(0),
            base_url: Set(Some(self.base_url)),
            models: Set(self.models.join(",")),
            group: Set(self.group),
            used_quota: Set(self.used_quota),
            model_mapping: Set(self.model_mapping),
            priority: Set(self.priority),
            config: Set(self.config),
            system_prompt: Set(self.system_prompt),
            soft_limit_usd: Set(self.soft_limit_usd),
            rpm_limit: Set(0),
            dpm_limit: Set(0),
            tpm_limit: Set(0),
            disable_reason: Set(None),
        }
    }
}

#[must_use]
pub fn user_row(username: &str, group: &str, quota: i64) -> users::ActiveModel {
    users::ActiveModel {
        id: NotSet,
        username: Set(username.to_string()),
        display_name: Set(username.to_string()),
        role: Set(1),
        status: Set(USER_STATUS_ENABLED),
        email: Set(Some(format!("{username}@example.com"))),
        group: Set(group.to_string()),
        quota: Set(quota),
        used_quota: Set(0),
        request_count: Set(0),
    }
}

/// 有限额度、永不过期的启用令牌
#[must_use]
pub fn token_row(user_id: i32, key: &str, remain_quota: i64) -> tokens::ActiveModel {
    tokens::ActiveModel {
        id: NotSet,
        user_id: Set(user_id),
        key: Set(key.to_string()),
        status: Set(TokenStatus::Enabled.code()),
        name: Set(format!("token-{key}")),
        created_time: Set(chrono::Utc::now().timestamp()),
        accessed_time: Set(0),
        expired_time: Set(-1),
        remain_quota: Set(remain_quota),
        unlimited_quota: Set(false),
        used_quota: Set(0),
        hard_limit_usd: Set(0),
        models: Set(None),
        subnet: Set(None),
        rpm_limit: Set(0),
        dpm_limit: Set(0),
        tpm_limit: Set(0),
        email: Set(None),
        expired_alert: Set(0),
        exhausted_alert: Set(0),
        moderations_enable: Set(false),
    }
}

#[must_use]
pub fn group_row(name: &str, group_ratio: f64, active_num: i32) -> groups::ActiveModel {
    groups::ActiveModel {
        id: NotSet,
        name: Set(name.to_string()),
        models: Set(String::new()),
        ratio: Set("{}".to_string()),
        group_ratio: Set(group_ratio),
        active_num: Set(active_num),
        status: Set(1),
        created_time: Set(chrono::Utc::now().timestamp()),
    }
}
