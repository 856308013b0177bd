//! # OpenAI 兼容适配器
//!
//! OpenAI、自定义渠道以及未知类型共用；请求基本透传，流式响应重写模型名并处理推理字段

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode, header};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;

use super::{Adaptor, RelayOutput, header_value, spawn_stream};
use crate::channel::ChannelKind;
use crate::error::{OpenAiError, RelayError};
use crate::logging::{LogComponent, LogStage};
use crate::relay::client::HttpClients;
use crate::relay::meta::RelayMeta;
use crate::relay::mode::RelayMode;
use crate::relay::model::{
    ChatCompletionsStreamResponse, Delta, GeneralOpenAiRequest, ImageRequest, ImageResponse,
    StreamChoice, StreamOptions, Usage, VideoRequest, VideoResponse,
};
use crate::relay::response::{completion_id, json_response, passthrough, read_body, unix_now};
use crate::relay::sse::{data_payload, upstream_lines};
use crate::relay::thinking::{ReasoningInliner, ThinkingHints};
use crate::relay::tokenizer::count_text;
use crate::{ldebug, lwarn};

const MODELS: &[&str] = &[
    "gpt-3.5-turbo",
    "gpt-4",
    "gpt-4-turbo",
    "gpt-4o",
    "gpt-4o-mini",
    "o1",
    "o1-mini",
    "o3-mini",
    "text-embedding-3-small",
    "text-embedding-3-large",
    "text-embedding-ada-002",
    "text-moderation-stable",
    "text-moderation-latest",
    "dall-e-2",
    "dall-e-3",
    "whisper-1",
    "tts-1",
    "tts-1-hd",
];

#[derive(Debug, Clone)]
pub struct OpenAiAdaptor {
    clients: Arc<HttpClients>,
}

impl OpenAiAdaptor {
    #[must_use]
    pub const fn new(clients: Arc<HttpClients>) -> Self {
        Self { clients }
    }
}

/// 上游缺失用量时按文本估算；只有总数时补齐提示部分
pub(super) fn settle_usage(usage: Option<Usage>, text: &str, prompt_tokens: i64, model: &str) -> Usage {
    let mut usage = usage.unwrap_or_default();
    if usage.total_tokens == 0 && usage.completion_tokens == 0 {
        let thoughts = usage.thoughts_tokens;
        usage = Usage::new(prompt_tokens, count_text(text, model));
        usage.thoughts_tokens = thoughts;
    } else if usage.prompt_tokens == 0 {
        usage.prompt_tokens = prompt_tokens;
        usage.completion_tokens = (usage.total_tokens - prompt_tokens).max(0);
    }
    if usage.total_tokens == 0 {
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
    }
    usage
}

/// 响应体中的 `error` 对象（部分上游在 200 响应里返回错误）
fn embedded_error(value: &Value, status: StatusCode) -> Option<RelayError> {
    let error = value.get("error")?;
    let kind = error.get("type").and_then(Value::as_str).unwrap_or_default();
    if kind.is_empty() {
        return None;
    }
    let error: OpenAiError = serde_json::from_value(error.clone()).ok()?;
    Some(RelayError {
        error,
        status_code: status,
    })
}

/// 对话流：逐帧重写模型名、内联推理、累积文本与用量
pub(super) fn stream_chat(response: reqwest::Response, meta: &RelayMeta, fresh_ids: bool) -> RelayOutput {
    let meta = meta.clone();
    spawn_stream(meta.request_id.clone(), move |mut writer| async move {
        let mut lines = upstream_lines(response);
        let mut inliner = ReasoningInliner::new(meta.thinking.clone());
        let mut text = String::new();
        let mut usage = None;
        let mut last_id = completion_id();
        let mut created = unix_now();
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    lwarn!(&meta.request_id, LogStage::Response, LogComponent::Adaptor, "stream_read_failed", "读取上游流失败", error = %e);
                    break;
                }
            };
            let Some(payload) = data_payload(&line) else {
                continue;
            };
            if payload == "[DONE]" {
                break;
            }
            let mut chunk: ChatCompletionsStreamResponse = match serde_json::from_str(payload) {
                Ok(chunk) => chunk,
                Err(e) => {
                    ldebug!(&meta.request_id, LogStage::Response, LogComponent::Adaptor, "stream_frame_passthrough", "无法解析的流式帧原样转发", error = %e);
                    if !writer.send_raw(payload).await {
                        break;
                    }
                    continue;
                }
            };
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.choices.is_empty() && chunk.usage.is_none() {
                continue;
            }
            if fresh_ids {
                chunk.id = completion_id();
                chunk.created = unix_now();
            }
            chunk.model.clone_from(&meta.origin_model);
            for choice in &mut chunk.choices {
                let reasoning = choice
                    .delta
                    .reasoning_content
                    .take()
                    .or_else(|| choice.delta.reasoning.take());
                let inlined = inliner.push(reasoning.as_deref(), choice.delta.content.as_deref());
                if let Some(content) = &inlined.content {
                    text.push_str(content);
                }
                if let Some(reasoning) = &inlined.reasoning {
                    text.push_str(reasoning);
                }
                choice.delta.content = inlined.content;
                choice.delta.reasoning_content = inlined.reasoning;
            }
            last_id.clone_from(&chunk.id);
            created = chunk.created;
            if !writer.send_json(&chunk).await {
                break;
            }
        }
        if let Some(tail) = inliner.finish() {
            text.push_str(&tail);
            let chunk = ChatCompletionsStreamResponse::chunk(
                &last_id,
                created,
                &meta.origin_model,
                StreamChoice {
                    delta: Delta {
                        content: Some(tail),
                        ..Delta::default()
                    },
                    ..StreamChoice::default()
                },
            );
            writer.send_json(&chunk).await;
        }
        writer.done().await;
        writer.summary(settle_usage(usage, &text, meta.prompt_tokens, &meta.actual_model))
    })
}

/// 旧版补全流：原样转发，只收集文本与用量
fn stream_completions(response: reqwest::Response, meta: &RelayMeta) -> RelayOutput {
    let meta = meta.clone();
    spawn_stream(meta.request_id.clone(), move |mut writer| async move {
        let mut lines = upstream_lines(response);
        let mut text = String::new();
        let mut usage = None;
        while let Some(Ok(line)) = lines.next().await {
            let Some(payload) = data_payload(&line) else {
                continue;
            };
            if payload == "[DONE]" {
                break;
            }
            if let Ok(value) = serde_json::from_str::<Value>(payload) {
                if let Some(choices) = value["choices"].as_array() {
                    text.extend(choices.iter().filter_map(|c| c["text"].as_str()));
                }
                if let Ok(found) = serde_json::from_value::<Usage>(value["usage"].clone()) {
                    if !found.is_empty() {
                        usage = Some(found);
                    }
                }
            }
            if !writer.send_raw(payload).await {
                break;
            }
        }
        writer.done().await;
        writer.summary(settle_usage(usage, &text, meta.prompt_tokens, &meta.actual_model))
    })
}

/// 非流式文本响应：内联推理、补齐用量
pub(super) fn buffered_text(status: StatusCode, body: &Bytes, meta: &RelayMeta) -> Result<RelayOutput, RelayError> {
    let mut value: Value = serde_json::from_slice(body).map_err(|e| {
        RelayError::wrap(e, "unmarshal_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
    })?;
    if let Some(err) = embedded_error(&value, status) {
        return Err(err);
    }
    let mut text = String::new();
    if let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices {
            if let Some(completion) = choice.get("text").and_then(Value::as_str) {
                text.push_str(completion);
            }
            let Some(message) = choice.get_mut("message").and_then(Value::as_object_mut) else {
                continue;
            };
            let reasoning = message
                .remove("reasoning")
                .or_else(|| message.remove("reasoning_content"))
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let content = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let (content, reasoning) = ReasoningInliner::inline_buffered(&meta.thinking, &reasoning, &content);
            text.push_str(&content);
            if let Some(reasoning) = reasoning {
                text.push_str(&reasoning);
                message.insert("reasoning_content".to_string(), Value::String(reasoning));
            }
            if message.get("content").is_some_and(Value::is_string) {
                message.insert("content".to_string(), Value::String(content));
            }
        }
    }
    let reported = value
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
        .filter(|u| !u.is_empty());
    let missing = reported.is_none();
    let usage = settle_usage(reported, &text, meta.prompt_tokens, &meta.actual_model);
    if let Some(object) = value.as_object_mut() {
        if meta.mode.is_text() && meta.mode != RelayMode::Embeddings {
            object.insert("model".to_string(), Value::String(meta.origin_model.clone()));
        }
        if missing && meta.mode != RelayMode::Moderations {
            if let Ok(encoded) = serde_json::to_value(usage) {
                object.insert("usage".to_string(), encoded);
            }
        }
    }
    Ok(RelayOutput::Complete {
        response: json_response(status, &value)?,
        usage,
    })
}

/// 透传类响应（图片、音频、视频、代理）
pub(super) async fn passthrough_output(response: reqwest::Response, meta: &RelayMeta) -> Result<RelayOutput, RelayError> {
    let (status, headers, body) = read_body(response).await?;
    let usage = match meta.mode {
        RelayMode::ImagesGenerations | RelayMode::ImagesEdits => serde_json::from_slice::<ImageResponse>(&body)
            .ok()
            .and_then(|r| r.usage)
            .unwrap_or_default(),
        RelayMode::VideoGenerations => serde_json::from_slice::<VideoResponse>(&body)
            .ok()
            .and_then(|r| r.usage)
            .unwrap_or_default(),
        RelayMode::AudioSpeech => Usage::new(meta.prompt_tokens, 0),
        RelayMode::AudioTranscription | RelayMode::AudioTranslation => {
            let text = serde_json::from_slice::<Value>(&body)
                .ok()
                .and_then(|v| v["text"].as_str().map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
            Usage::new(0, count_text(&text, &meta.actual_model))
        }
        _ => Usage::default(),
    };
    Ok(RelayOutput::Complete {
        response: passthrough(status, &headers, body),
        usage,
    })
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn client(&self) -> &reqwest::Client {
        &self.clients.relay
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String, RelayError> {
        Ok(format!("{}{}", meta.base_url, meta.request_path))
    }

    fn setup_headers(
        &self,
        headers: &mut HeaderMap,
        meta: &RelayMeta,
        _inbound: &HeaderMap,
    ) -> Result<(), RelayError> {
        headers.insert(
            header::AUTHORIZATION,
            header_value(&format!("Bearer {}", meta.api_key))?,
        );
        Ok(())
    }

    async fn convert_text_request(
        &self,
        meta: &mut RelayMeta,
        mut request: GeneralOpenAiRequest,
    ) -> Result<Value, RelayError> {
        meta.thinking = ThinkingHints::from_request(request.enabled_thinking());
        request.thinking = None;
        request.model.clone_from(&meta.actual_model);
        if request.stream
            && meta.channel_kind == ChannelKind::OpenAi
            && meta.mode == RelayMode::ChatCompletions
        {
            request
                .stream_options
                .get_or_insert_with(StreamOptions::default)
                .include_usage = true;
        }
        serde_json::to_value(&request).map_err(|e| {
            RelayError::wrap(e, "marshal_request_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
        })
    }

    async fn convert_image_request(
        &self,
        meta: &mut RelayMeta,
        mut request: ImageRequest,
    ) -> Result<Value, RelayError> {
        request.model.clone_from(&meta.actual_model);
        serde_json::to_value(&request).map_err(|e| {
            RelayError::wrap(e, "marshal_request_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
        })
    }

    async fn convert_video_request(
        &self,
        meta: &mut RelayMeta,
        mut request: VideoRequest,
    ) -> Result<Value, RelayError> {
        request.model.clone_from(&meta.actual_model);
        serde_json::to_value(&request).map_err(|e| {
            RelayError::wrap(e, "marshal_request_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
        })
    }

    async fn do_response(
        &self,
        response: reqwest::Response,
        meta: &mut RelayMeta,
    ) -> Result<RelayOutput, RelayError> {
        match meta.mode {
            RelayMode::ChatCompletions if meta.is_stream => Ok(stream_chat(response, meta, false)),
            RelayMode::Completions if meta.is_stream => Ok(stream_completions(response, meta)),
            mode if mode.is_text() => {
                let (status, _, body) = read_body(response).await?;
                buffered_text(status, &body, meta)
            }
            _ => passthrough_output(response, meta).await,
        }
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }
}
