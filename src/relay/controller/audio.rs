//! # 语音合成与转写
//!
//! 只走 OpenAI 兼容适配器；转写请求体原样透传

use axum::http::StatusCode;
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;

use super::{AttemptFailure, Charged, RelayRequest, Settlement, encode_body, finish, round_trip};
use crate::app::AppContext;
use crate::billing::text_quota;
use crate::channel::{Channel, ChannelKind};
use crate::error::RelayError;
use crate::relay::body::parse_json;
use crate::relay::mode::RelayMode;
use crate::relay::ratio::model_ratio;
use crate::relay::response::not_implemented;

const fn openai_compatible(kind: ChannelKind) -> bool {
    !matches!(kind, ChannelKind::Anthropic | ChannelKind::Gemini)
}

/// 语音合成按输入字符计费
pub(super) fn speech_quota(characters: i64, ratio: f64) -> i64 {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let quota = (characters as f64 * ratio).ceil() as i64;
    quota
}

pub(super) async fn relay_audio(
    ctx: &AppContext,
    request: &RelayRequest,
    channel: &Channel,
) -> Result<Response, AttemptFailure> {
    if !openai_compatible(channel.kind) {
        return Err(not_implemented().into());
    }
    let mut meta = request.meta(channel);
    let options = ctx.options.snapshot();
    let group_ratio = options.group_ratio(&meta.group);

    let body = if meta.mode == RelayMode::AudioSpeech {
        let mut speech: Value = parse_json(&request.body)
            .map_err(|e| RelayError::wrap(e.message(), "invalid_audio_request", StatusCode::BAD_REQUEST))?;
        let input = speech["input"].as_str().unwrap_or_default().to_string();
        if input.is_empty() {
            return Err(RelayError::wrap("field input is required", "invalid_audio_request", StatusCode::BAD_REQUEST).into());
        }
        let model = speech["model"]
            .as_str()
            .filter(|m| !m.is_empty())
            .map_or_else(|| request.auth.request_model.clone(), str::to_string);
        meta.map_model(&model);
        speech["model"] = Value::String(meta.actual_model.clone());
        meta.prompt_tokens = i64::try_from(input.chars().count()).unwrap_or(i64::MAX);
        encode_body(&speech)?
    } else {
        // 表单请求无法改写模型，沿用客户端给出的名字
        let model = request.auth.request_model.clone();
        meta.map_model(&model);
        Bytes::clone(&request.body)
    };

    let model_ratio = model_ratio(&options, &meta.origin_model);
    let ratio = model_ratio * group_ratio;
    let pre_tokens = if meta.mode == RelayMode::AudioSpeech {
        meta.prompt_tokens
    } else {
        0
    };
    let pre = ctx
        .accountant
        .pre_consume(&request.auth, &meta.request_id, pre_tokens, 0, ratio)
        .await?;

    let adaptor = ctx.adaptors.resolve(meta.channel_kind);
    adaptor.init(&mut meta);
    let output = round_trip(adaptor.as_ref(), &mut meta, body, &request.headers)
        .await
        .map_err(|e| AttemptFailure::with_hints(e, &meta))?;

    let is_speech = meta.mode == RelayMode::AudioSpeech;
    let settlement = Settlement {
        pre: Some(pre),
        model_name: meta.origin_model.clone(),
        content: format!("模型倍率 {model_ratio:.2}，分组倍率 {group_ratio:.2}"),
        quota: Box::new(move |usage| {
            if is_speech {
                Charged {
                    quota: speech_quota(usage.prompt_tokens, ratio),
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: 0,
                }
            } else {
                Charged {
                    quota: text_quota(0, usage.completion_tokens, 1.0, ratio),
                    prompt_tokens: 0,
                    completion_tokens: usage.completion_tokens,
                }
            }
        }),
    };
    Ok(finish(ctx, &meta, output, settlement))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speech_quota_rounds_up() {
        assert_eq!(speech_quota(10, 7.5), 75);
        assert_eq!(speech_quota(3, 0.5), 2);
        assert_eq!(speech_quota(0, 15.0), 0);
    }

    #[test]
    fn test_only_openai_compatible_kinds() {
        assert!(openai_compatible(ChannelKind::OpenAi));
        assert!(openai_compatible(ChannelKind::Custom));
        assert!(!openai_compatible(ChannelKind::Gemini));
    }
}
