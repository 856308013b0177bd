//! # 令牌计数
//!
//! 按模型选择 BPE 词表计数；非 OpenAI 模型统一使用 `cl100k_base`。
//! 用于预扣时的提示令牌与上游未返回用量时的补全令牌。

use serde_json::Value;
use tiktoken_rs::{CoreBPE, tokenizer};

use super::model::{ContentPart, Message};

/// 每张图片按低精度计
const TOKENS_PER_IMAGE: i64 = 85;

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    match tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase) {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase | tokenizer::Tokenizer::Gpt2 => {
            tiktoken_rs::r50k_base_singleton()
        }
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
    }
}

fn encoded_len(bpe: &CoreBPE, text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    i64::try_from(bpe.encode_with_special_tokens(text).len()).unwrap_or(i64::MAX)
}

/// 一段文本的令牌数
#[must_use]
pub fn count_text(text: &str, model: &str) -> i64 {
    encoded_len(bpe_for_model(model), text)
}

/// 对话消息的提示令牌数
#[must_use]
pub fn count_messages(messages: &[Message], model: &str) -> i64 {
    let bpe = bpe_for_model(model);
    let (per_message, per_name) = if model.starts_with("gpt-3.5") {
        (4, -1)
    } else {
        (3, 1)
    };
    let mut total = 0_i64;
    for message in messages {
        total = total.saturating_add(per_message + encoded_len(bpe, &message.role));
        for part in message.parse_content() {
            total = total.saturating_add(match part {
                ContentPart::Text(text) => encoded_len(bpe, &text),
                ContentPart::ImageUrl(_) => TOKENS_PER_IMAGE,
            });
        }
        if let Some(name) = &message.name {
            total = total.saturating_add(per_name + encoded_len(bpe, name));
        }
    }
    // 回复引导
    total.saturating_add(3).max(0)
}

/// `prompt` / `input` 字段的令牌数
#[must_use]
pub fn count_input(input: Option<&Value>, model: &str) -> i64 {
    let bpe = bpe_for_model(model);
    match input {
        Some(Value::String(text)) => encoded_len(bpe, text),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|text| encoded_len(bpe, text))
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_count_text() {
        assert_eq!(count_text("", "gpt-4o"), 0);
        assert_eq!(count_text("hello world", "gpt-3.5-turbo"), 2);
        assert_eq!(count_text("hello world", "gpt-4o"), 2);
        // 未知模型回落到 cl100k_base
        assert_eq!(
            count_text("hello world", "claude-3-7-sonnet-20250219"),
            count_text("hello world", "gpt-4")
        );
    }

    #[test]
    fn test_count_messages_has_overhead() {
        let messages = vec![Message::text("user", "hello world")];
        // 3 (消息) + 1 ("user") + 2 (正文) + 3 (回复引导)
        assert_eq!(count_messages(&messages, "gpt-4"), 9);
        // gpt-3.5 每条消息 4
        assert_eq!(count_messages(&messages, "gpt-3.5-turbo"), 10);
        assert_eq!(count_input(Some(&json!(["hello world", "hello world"])), "gpt-4"), 4);
        assert_eq!(count_input(None, "gpt-4"), 0);
    }
}
