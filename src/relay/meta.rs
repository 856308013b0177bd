//! # 单次中继尝试的上下文

use std::collections::HashMap;
use std::time::Instant;

use super::mode::RelayMode;
use super::thinking::ThinkingHints;
use crate::auth::AuthContext;
use crate::channel::{Channel, ChannelConfig, ChannelKind};

/// 适配器在处理过程中留给失败处理的提示
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdaptorHints {
    /// 上游建议的重试等待（秒）
    pub gemini_delay: Option<i64>,
    /// 本次请求引用的已上传文件
    pub file_uri: Option<String>,
    /// OpenRouter 指定的上游提供方
    pub provider: Option<String>,
}

/// 中继元数据；每次切换渠道都重新构造
#[derive(Debug, Clone)]
pub struct RelayMeta {
    pub request_id: String,
    pub mode: RelayMode,
    pub channel_id: i32,
    pub channel_name: String,
    pub channel_kind: ChannelKind,
    pub token_id: i32,
    pub token_name: String,
    pub user_id: i32,
    pub group: String,
    pub model_mapping: HashMap<String, String>,
    pub base_url: String,
    /// 渠道凭证
    pub api_key: String,
    pub config: ChannelConfig,
    pub is_stream: bool,
    /// 用户请求的模型名
    pub origin_model: String,
    /// 映射后的模型名
    pub actual_model: String,
    /// 原始路径（含查询串）
    pub request_path: String,
    pub prompt_tokens: i64,
    pub system_prompt: Option<String>,
    pub thinking: ThinkingHints,
    pub use_thinking: bool,
    pub hints: AdaptorHints,
    pub start_time: Instant,
}

impl RelayMeta {
    #[must_use]
    pub fn new(auth: &AuthContext, channel: &Channel, request_id: &str, request_path: &str) -> Self {
        let path = request_path.split('?').next().unwrap_or_default();
        let base_url = if channel.base_url.is_empty() {
            channel.kind.default_base_url().to_string()
        } else {
            channel.base_url.trim_end_matches('/').to_string()
        };
        Self {
            request_id: request_id.to_string(),
            mode: RelayMode::from_path(path),
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            channel_kind: channel.kind,
            token_id: auth.token_id,
            token_name: auth.token_name.clone(),
            user_id: auth.user_id,
            group: auth.group.clone(),
            model_mapping: channel.model_mapping.clone(),
            base_url,
            api_key: channel.key.clone(),
            config: channel.config.clone(),
            is_stream: false,
            origin_model: auth.request_model.clone(),
            actual_model: channel.mapped_model(&auth.request_model),
            request_path: request_path.to_string(),
            prompt_tokens: 0,
            system_prompt: channel.system_prompt.clone().filter(|p| !p.is_empty()),
            thinking: ThinkingHints::default(),
            use_thinking: false,
            hints: AdaptorHints::default(),
            start_time: Instant::now(),
        }
    }

    /// 映射模型名，返回是否发生映射
    pub fn map_model(&mut self, model: &str) -> bool {
        self.origin_model = model.to_string();
        match self.model_mapping.get(model).filter(|m| !m.is_empty()) {
            Some(mapped) => {
                self.actual_model.clone_from(mapped);
                true
            }
            None => {
                self.actual_model = model.to_string();
                false
            }
        }
    }

    /// 计费时使用的模型名
    #[must_use]
    pub fn billing_model(&self) -> String {
        if self.use_thinking {
            format!("{}{}", self.origin_model, super::ratio::THINKING_SUFFIX)
        } else {
            self.origin_model.clone()
        }
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_meta_from_channel() {
        let mut channel = fixtures::channel(3, ChannelKind::Gemini, 0, &["gemini-1.5-pro"]);
        channel.model_mapping.insert("gemini-1.5-pro".into(), "gemini-1.5-pro-002".into());
        let auth = AuthContext {
            request_model: "gemini-1.5-pro".to_string(),
            token_id: 9,
            ..AuthContext::default()
        };
        let mut meta = RelayMeta::new(&auth, &channel, "rid", "/v1/chat/completions?x=1");
        assert_eq!(meta.mode, RelayMode::ChatCompletions);
        assert_eq!(meta.actual_model, "gemini-1.5-pro-002");
        assert_eq!(meta.base_url, ChannelKind::Gemini.default_base_url());
        assert!(meta.map_model("gemini-1.5-pro"));
        assert!(!meta.map_model("other"));
        meta.use_thinking = true;
        assert_eq!(meta.billing_model(), "other-thinking");
    }
}
