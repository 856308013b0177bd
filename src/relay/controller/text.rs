//! # 文本类中继
//!
//! 对话、补全、向量、审核

use axum::http::StatusCode;
use axum::response::Response;

use super::{AttemptFailure, Charged, RelayRequest, Settlement, encode_body, finish, round_trip};
use crate::app::AppContext;
use crate::billing::{consume_log_content, text_quota};
use crate::channel::Channel;
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::relay::body::parse_json;
use crate::relay::mode::RelayMode;
use crate::relay::model::{GeneralOpenAiRequest, Message};
use crate::relay::ratio::{completion_ratio, model_ratio};
use crate::relay::tokenizer::{count_input, count_messages};
use crate::ldebug;

fn invalid(message: &str) -> RelayError {
    RelayError::wrap(message, "invalid_text_request", StatusCode::BAD_REQUEST)
}

/// 请求字段校验
pub(super) fn validate(request: &GeneralOpenAiRequest, mode: RelayMode) -> Result<(), RelayError> {
    let max_tokens = request.max_completion_tokens.unwrap_or(request.max_tokens);
    if max_tokens < 0 || max_tokens > i64::from(i32::MAX) {
        return Err(invalid("max_tokens is invalid"));
    }
    if request.model.is_empty() {
        return Err(invalid("model is required"));
    }
    match mode {
        RelayMode::Completions if request.prompt.is_none() => Err(invalid("field prompt is required")),
        RelayMode::ChatCompletions if request.messages.is_empty() => {
            Err(invalid("field messages is required"))
        }
        RelayMode::Embeddings | RelayMode::Moderations if request.input.is_none() => {
            Err(invalid("field input is required"))
        }
        _ => Ok(()),
    }
}

/// 用渠道的系统提示词替换首条系统消息或插入开头；返回是否改写
pub(super) fn apply_system_prompt(request: &mut GeneralOpenAiRequest, prompt: Option<&str>) -> bool {
    let Some(prompt) = prompt.filter(|p| !p.is_empty()) else {
        return false;
    };
    if request.messages.is_empty() {
        return false;
    }
    match request.messages.first_mut() {
        Some(first) if first.role == "system" => {
            first.content = serde_json::Value::String(prompt.to_string());
        }
        _ => request.messages.insert(0, Message::text("system", prompt)),
    }
    true
}

fn prompt_tokens(request: &GeneralOpenAiRequest, mode: RelayMode) -> i64 {
    let model = request.model.as_str();
    match mode {
        RelayMode::ChatCompletions => count_messages(&request.messages, model),
        RelayMode::Completions => count_input(request.prompt.as_ref(), model),
        RelayMode::Embeddings | RelayMode::Moderations => count_input(request.input.as_ref(), model),
        _ => 0,
    }
}

pub(super) async fn relay_text(
    ctx: &AppContext,
    request: &RelayRequest,
    channel: &Channel,
) -> Result<Response, AttemptFailure> {
    let mut meta = request.meta(channel);
    let mut text: GeneralOpenAiRequest = parse_json(&request.body)
        .map_err(|e| RelayError::wrap(e.message(), "invalid_text_request", StatusCode::BAD_REQUEST))?;
    if text.model.is_empty() {
        text.model.clone_from(&request.auth.request_model);
    }
    validate(&text, meta.mode)?;

    meta.is_stream = text.stream;
    meta.map_model(&text.model);
    let reset = apply_system_prompt(&mut text, meta.system_prompt.as_deref());
    meta.prompt_tokens = prompt_tokens(&text, meta.mode);

    let options = ctx.options.snapshot();
    let group_ratio = options.group_ratio(&meta.group);
    let pre_ratio = model_ratio(&options, &meta.origin_model) * group_ratio;
    let max_tokens = text.max_completion_tokens.unwrap_or(text.max_tokens);
    let pre = ctx
        .accountant
        .pre_consume(&request.auth, &meta.request_id, meta.prompt_tokens, max_tokens, pre_ratio)
        .await?;

    let adaptor = ctx.adaptors.resolve(meta.channel_kind);
    adaptor.init(&mut meta);
    let converted = adaptor
        .convert_text_request(&mut meta, text)
        .await
        .map_err(|e| AttemptFailure::with_hints(e, &meta))?;
    let body = encode_body(&converted)?;
    ldebug!(
        &meta.request_id,
        LogStage::UpstreamRequest,
        LogComponent::Relay,
        "text_request_converted",
        "文本请求已转换",
        mode = %meta.mode,
        model = %meta.actual_model,
        prompt_tokens = meta.prompt_tokens
    );

    let output = round_trip(adaptor.as_ref(), &mut meta, body, &request.headers)
        .await
        .map_err(|e| AttemptFailure::with_hints(e, &meta))?;

    let billing_model = meta.billing_model();
    let model_ratio = model_ratio(&options, &billing_model);
    let completion_ratio = completion_ratio(&options, &billing_model, meta.channel_kind);
    let ratio = model_ratio * group_ratio;
    let fallback_prompt = meta.prompt_tokens;
    let settlement = Settlement {
        pre: Some(pre),
        model_name: meta.origin_model.clone(),
        content: consume_log_content(model_ratio, group_ratio, completion_ratio, reset),
        quota: Box::new(move |usage| {
            let prompt_tokens = if usage.prompt_tokens > 0 {
                usage.prompt_tokens
            } else {
                fallback_prompt
            };
            Charged {
                quota: text_quota(prompt_tokens, usage.completion_tokens, completion_ratio, ratio),
                prompt_tokens,
                completion_tokens: usage.completion_tokens,
            }
        }),
    };
    Ok(finish(ctx, &meta, output, settlement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn request(value: serde_json::Value) -> GeneralOpenAiRequest {
        serde_json::from_value(value).unwrap()
    }

    #[rstest]
    #[case(RelayMode::ChatCompletions, json!({"model": "gpt-4o"}), Some("field messages is required"))]
    #[case(RelayMode::Completions, json!({"model": "gpt-3.5-turbo-instruct"}), Some("field prompt is required"))]
    #[case(RelayMode::Embeddings, json!({"model": "text-embedding-3-small"}), Some("field input is required"))]
    #[case(RelayMode::Moderations, json!({"model": "text-moderation-stable", "input": "x"}), None)]
    #[case(RelayMode::ChatCompletions, json!({"model": "gpt-4o", "max_tokens": -1, "messages": [{"role": "user", "content": "hi"}]}), Some("max_tokens is invalid"))]
    #[case(RelayMode::ChatCompletions, json!({"messages": [{"role": "user", "content": "hi"}]}), Some("model is required"))]
    fn test_validate(
        #[case] mode: RelayMode,
        #[case] body: serde_json::Value,
        #[case] expected: Option<&str>,
    ) {
        let result = validate(&request(body), mode);
        match expected {
            Some(message) => {
                let err = result.unwrap_err();
                assert_eq!(err.status_code, StatusCode::BAD_REQUEST);
                assert_eq!(err.error.message, message);
                assert_eq!(err.code_str(), "invalid_text_request");
            }
            None => assert!(result.is_ok()),
        }
    }

    #[test]
    fn test_system_prompt_replaces_or_prepends() {
        let mut with_system = request(json!({
            "model": "gpt-4o",
            "messages": [{"role": "system", "content": "old"}, {"role": "user", "content": "hi"}]
        }));
        assert!(apply_system_prompt(&mut with_system, Some("new")));
        assert_eq!(with_system.messages.len(), 2);
        assert_eq!(with_system.messages[0].string_content(), "new");

        let mut without = request(json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}));
        assert!(apply_system_prompt(&mut without, Some("be brief")));
        assert_eq!(without.messages[0].role, "system");
        assert_eq!(without.messages[1].role, "user");

        let mut untouched = request(json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}));
        assert!(!apply_system_prompt(&mut untouched, None));
        assert_eq!(untouched.messages.len(), 1);
    }
}
