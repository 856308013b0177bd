//! # 渠道运行时类型

use std::collections::HashMap;
use std::fmt;

use entity::channels;
use serde::{Deserialize, Serialize};

use crate::repository::split_list;

/// 渠道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
    Sleeping,
    Unactivated,
    Unknown,
}

impl ChannelStatus {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Enabled => 1,
            Self::ManuallyDisabled => 2,
            Self::AutoDisabled => 3,
            Self::Sleeping => 4,
            Self::Unactivated => 5,
            Self::Unknown => 0,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Enabled,
            2 => Self::ManuallyDisabled,
            3 => Self::AutoDisabled,
            4 => Self::Sleeping,
            5 => Self::Unactivated,
            _ => Self::Unknown,
        }
    }
}

/// 渠道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    OpenAi,
    Custom,
    Anthropic,
    OpenRouter,
    Gemini,
    Other(i32),
}

impl ChannelKind {
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::OpenAi,
            8 => Self::Custom,
            14 => Self::Anthropic,
            20 => Self::OpenRouter,
            24 => Self::Gemini,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::OpenAi => 1,
            Self::Custom => 8,
            Self::Anthropic => 14,
            Self::OpenRouter => 20,
            Self::Gemini => 24,
            Self::Other(code) => code,
        }
    }

    /// 小写名称，用于配置匹配与日志
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Custom => "custom",
            Self::Anthropic => "anthropic",
            Self::OpenRouter => "openrouter",
            Self::Gemini => "gemini",
            Self::Other(_) => "other",
        }
    }

    #[must_use]
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenRouter => "https://openrouter.ai/api",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Custom | Self::Other(_) => "",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 渠道附加配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub region: String,
    pub sk: String,
    pub ak: String,
    pub user_id: String,
    pub api_version: String,
    pub library_id: String,
    pub plugin: Option<serde_json::Value>,
    pub vertex_ai_project_id: String,
    pub vertex_ai_adc: String,
}

/// 内存中的渠道
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: i32,
    pub name: String,
    pub kind: ChannelKind,
    pub status: ChannelStatus,
    pub key: String,
    pub base_url: String,
    pub config: ChannelConfig,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    pub priority: i64,
    pub weight: i32,
    pub rpm_limit: i32,
    pub dpm_limit: i32,
    pub tpm_limit: i32,
    pub system_prompt: Option<String>,
    pub model_mapping: HashMap<String, String>,
    pub soft_limit_usd: f64,
    pub used_quota: i64,
}

impl Channel {
    /// 由数据库行构造；无法解析的 JSON 字段按空值处理
    #[must_use]
    pub fn from_model(model: channels::Model) -> Self {
        let kind = ChannelKind::from_code(model.channel_type);
        let base_url = model
            .base_url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| kind.default_base_url().to_string());
        let model_mapping = model
            .model_mapping
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .and_then(|m| serde_json::from_str(m).ok())
            .unwrap_or_default();
        let config = serde_json::from_str(&model.config).unwrap_or_default();

        Self {
            id: model.id,
            name: model.name,
            kind,
            status: ChannelStatus::from_code(model.status),
            key: model.key,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
            models: split_list(&model.models),
            groups: split_list(&model.group),
            priority: model.priority,
            weight: model.weight,
            rpm_limit: model.rpm_limit,
            dpm_limit: model.dpm_limit,
            tpm_limit: model.tpm_limit,
            system_prompt: model.system_prompt.filter(|p| !p.is_empty()),
            model_mapping,
            soft_limit_usd: model.soft_limit_usd,
            used_quota: model.used_quota,
        }
    }

    /// 映射后的上游模型名
    #[must_use]
    pub fn mapped_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .filter(|m| !m.is_empty())
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    #[must_use]
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}
