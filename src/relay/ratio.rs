//! # 计费倍率
//!
//! 倍率 1 对应 $0.002 / 1K tokens。`options` 表中的 `ModelRatio` /
//! `CompletionRatio` 覆盖这里的默认表。

use std::collections::HashMap;

use crate::channel::ChannelKind;
use crate::config::RuntimeOptions;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

/// 未知模型使用的倍率，宁可多收
pub const UNKNOWN_MODEL_RATIO: f64 = 30.0;

/// 思考模式下补全倍率查表使用的后缀
pub const THINKING_SUFFIX: &str = "-thinking";

const MODEL_RATIOS: &[(&str, f64)] = &[
    // OpenAI
    ("gpt-3.5-turbo", 0.75),
    ("gpt-3.5-turbo-0125", 0.25),
    ("gpt-3.5-turbo-instruct", 0.75),
    ("gpt-4", 15.0),
    ("gpt-4-turbo", 5.0),
    ("gpt-4o", 1.25),
    ("gpt-4o-2024-08-06", 1.25),
    ("gpt-4o-mini", 0.075),
    ("gpt-4.1", 1.0),
    ("gpt-4.1-mini", 0.2),
    ("o1", 7.5),
    ("o1-mini", 1.5),
    ("o3-mini", 0.55),
    ("text-embedding-ada-002", 0.05),
    ("text-embedding-3-small", 0.01),
    ("text-embedding-3-large", 0.065),
    ("text-moderation-stable", 0.1),
    ("text-moderation-latest", 0.1),
    ("dall-e-2", 8.0),
    ("dall-e-3", 20.0),
    ("whisper-1", 15.0),
    ("tts-1", 7.5),
    ("tts-1-hd", 15.0),
    // Anthropic
    ("claude-instant-1.2", 0.4),
    ("claude-2.0", 4.0),
    ("claude-2.1", 4.0),
    ("claude-3-haiku-20240307", 0.125),
    ("claude-3-5-haiku-20241022", 0.5),
    ("claude-3-sonnet-20240229", 1.5),
    ("claude-3-5-sonnet-20240620", 1.5),
    ("claude-3-5-sonnet-20241022", 1.5),
    ("claude-3-7-sonnet-20250219", 1.5),
    ("claude-sonnet-4-20250514", 1.5),
    ("claude-3-opus-20240229", 7.5),
    ("claude-opus-4-20250514", 7.5),
    // Gemini
    ("gemini-pro", 0.25),
    ("gemini-1.5-pro", 1.25),
    ("gemini-1.5-flash", 0.0375),
    ("gemini-2.0-flash", 0.05),
    ("gemini-2.0-flash-exp-image-generation", 0.05),
    ("gemini-2.5-flash", 0.15),
    ("gemini-2.5-pro", 0.625),
    ("text-embedding-004", 0.01),
    ("imagen-3.0-generate-002", 10.0),
    ("veo-2.0-generate-001", 175.0),
];

const COMPLETION_RATIOS: &[(&str, f64)] = &[
    ("gpt-4o-mini", 4.0),
    ("gpt-4.1", 4.0),
    ("gpt-4.1-mini", 4.0),
    ("o1", 4.0),
    ("o1-mini", 4.0),
    ("o3-mini", 4.0),
    ("gemini-2.0-flash", 4.0),
    ("gemini-2.5-flash", 4.0),
    ("gemini-2.5-flash-thinking", 23.333),
    ("gemini-2.5-pro", 8.0),
    ("gemini-2.5-pro-thinking", 8.0),
    ("claude-3-7-sonnet-20250219-thinking", 5.0),
    ("claude-sonnet-4-20250514-thinking", 5.0),
];

fn to_map(entries: &[(&str, f64)]) -> HashMap<String, f64> {
    entries
        .iter()
        .map(|(name, ratio)| ((*name).to_string(), *ratio))
        .collect()
}

/// 内置模型倍率表
#[must_use]
pub fn default_model_ratio() -> HashMap<String, f64> {
    to_map(MODEL_RATIOS)
}

/// 内置补全倍率表（含 `-thinking` 条目）
#[must_use]
pub fn default_completion_ratio() -> HashMap<String, f64> {
    to_map(COMPLETION_RATIOS)
}

/// 模型倍率；`-thinking` 后缀按基础模型计
#[must_use]
pub fn model_ratio(options: &RuntimeOptions, name: &str) -> f64 {
    let base = name.strip_suffix(THINKING_SUFFIX).unwrap_or(name);
    options
        .model_ratio
        .get(name)
        .or_else(|| options.model_ratio.get(base))
        .copied()
        .unwrap_or_else(|| {
            lwarn!("system", LogStage::Billing, LogComponent::Billing, "unknown_model_ratio", "模型未配置倍率，使用默认倍率", model = name);
            UNKNOWN_MODEL_RATIO
        })
}

/// 补全倍率：显式配置优先，其次按模型族推断
#[must_use]
pub fn completion_ratio(options: &RuntimeOptions, name: &str, kind: ChannelKind) -> f64 {
    if let Some(ratio) = options.completion_ratio.get(name) {
        return *ratio;
    }
    let base = name.strip_suffix(THINKING_SUFFIX).unwrap_or(name);
    if base != name {
        if let Some(ratio) = options.completion_ratio.get(base) {
            return *ratio;
        }
    }
    if base.starts_with("gpt-3.5") {
        if base == "gpt-3.5-turbo" || base.ends_with("0125") {
            return 3.0;
        }
        return 4.0 / 3.0;
    }
    if base.starts_with("gpt-4o") || base.starts_with("chatgpt-4o") {
        return 4.0;
    }
    if base.starts_with("gpt-4") {
        return 2.0;
    }
    if base.starts_with("claude-") {
        return 5.0;
    }
    if base.starts_with("gemini-") {
        return if matches!(kind, ChannelKind::Gemini) && base.contains("1.5") {
            4.0
        } else {
            3.0
        };
    }
    1.0
}

/// 图片尺寸倍率；不支持的尺寸返回 `None`
#[must_use]
pub fn image_size_ratio(model: &str, size: &str) -> Option<f64> {
    let table: &[(&str, f64)] = match model {
        "dall-e-2" => &[("256x256", 1.0), ("512x512", 1.125), ("1024x1024", 1.25)],
        "dall-e-3" => &[("1024x1024", 1.0), ("1024x1792", 2.0), ("1792x1024", 2.0)],
        _ => return Some(1.0),
    };
    table.iter().find(|(s, _)| *s == size).map(|(_, ratio)| *ratio)
}

/// 每个模型单次请求允许生成的图片数量范围
#[must_use]
pub fn image_n_range(model: &str) -> (i64, i64) {
    match model {
        "dall-e-2" => (1, 10),
        "dall-e-3" => (1, 1),
        _ => (1, 4),
    }
}

/// 提示词最大长度
#[must_use]
pub fn image_prompt_limit(model: &str) -> usize {
    match model {
        "dall-e-2" => 1000,
        "dall-e-3" => 4000,
        _ => 8000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn options() -> RuntimeOptions {
        RuntimeOptions::from_config(&AppConfig::default())
    }

    #[test]
    fn test_unknown_model_is_expensive() {
        let options = options();
        assert_eq!(model_ratio(&options, "no-such-model"), UNKNOWN_MODEL_RATIO);
        assert_eq!(model_ratio(&options, "gpt-4o"), 1.25);
        assert_eq!(model_ratio(&options, "gemini-2.5-flash-thinking"), 0.15);
    }

    #[test]
    fn test_completion_ratio_families() {
        let options = options();
        assert_eq!(completion_ratio(&options, "gpt-4o", ChannelKind::OpenAi), 4.0);
        assert_eq!(completion_ratio(&options, "gpt-4", ChannelKind::OpenAi), 2.0);
        assert_eq!(
            completion_ratio(&options, "claude-3-opus-20240229", ChannelKind::Anthropic),
            5.0
        );
        assert_eq!(
            completion_ratio(&options, "gemini-2.5-flash-thinking", ChannelKind::Gemini),
            23.333
        );
        // 没有专门的 thinking 条目时退回基础模型
        assert_eq!(
            completion_ratio(&options, "gemini-2.0-flash-thinking", ChannelKind::Gemini),
            4.0
        );
        assert_eq!(completion_ratio(&options, "text-embedding-3-small", ChannelKind::OpenAi), 1.0);
    }

    #[test]
    fn test_image_tables() {
        assert_eq!(image_size_ratio("dall-e-3", "1792x1024"), Some(2.0));
        assert_eq!(image_size_ratio("dall-e-2", "1792x1024"), None);
        assert_eq!(image_size_ratio("gemini-2.0-flash-exp-image-generation", "any"), Some(1.0));
        assert_eq!(image_n_range("dall-e-3"), (1, 1));
        assert_eq!(image_prompt_limit("dall-e-2"), 1000);
    }
}
