//! # Gemini 适配器
//!
//! 对话、向量、图片与视频生成；多媒体经文件接口上传后以 `fileData` 引用

mod files;
mod model;

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use futures::StreamExt;
use regex::Regex;
use serde_json::{Value, json};

use self::files::FileUploader;
use self::model::{
    BatchEmbeddingRequest, ChatRequest, ChatResponse, ChatTools, Content, EmbeddingRequest,
    ErrorResponse, FunctionCall, GenerationConfig, InlineData, Operation, Part, SafetySetting,
    ThinkingConfig, UsageMetadata, VideoImage, VideoInstance, VideoParameters,
};
use super::openai::settle_usage;
use super::{Adaptor, AdaptorDeps, RelayOutput, header_value, spawn_stream};
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::relay::meta::RelayMeta;
use crate::relay::mode::RelayMode;
use crate::relay::model::{
    ChatCompletionsStreamResponse, ContentPart, Delta, EmbeddingData, EmbeddingResponse, Function,
    GeneralOpenAiRequest, ImageData, ImageRequest, ImageResponse, Message, StreamChoice,
    TextChoice, TextResponse, Tool, Usage, VideoData, VideoRequest, VideoResponse,
};
use crate::relay::response::{completion_id, json_response, read_body, unix_now};
use crate::relay::sse::{UpstreamLines, data_payload, upstream_lines};
use crate::relay::thinking::{ReasoningInliner, ThinkingHints};
use crate::{linfo, lwarn};

const DEFAULT_VERSION: &str = "v1beta";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";
const VISION_MAX_IMAGES: usize = 16;
const MAX_IMAGE_N: i64 = 4;
const VIDEO_POLLS: usize = 30;
const DEFAULT_RETRY_DELAY: i64 = 60;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const NO_CANDIDATES: &str = "No candidates returned. Check your parameter of max_tokens";
const UNSAFE_IMAGE: &str =
    "Unable to generate image that is an unsafe image, such as graphically violent or gruesome";

const MODELS: &[&str] = &[
    "text-embedding-004",
    "gemini-1.5-pro",
    "gemini-1.5-flash",
    "gemini-1.5-flash-8b",
    "gemini-2.0-flash",
    "gemini-2.0-flash-exp",
    "gemini-2.0-flash-exp-image-generation",
    "gemini-2.5-flash",
    "gemini-2.5-flash-image",
    "gemini-2.5-pro",
    "veo-2.0-generate-001",
];

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

static DIGITS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\d+").ok());
static URL_IN_MESSAGE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"https?://[^\s]+").ok());

/// 同时输出文本与图片的模型
#[must_use]
pub fn is_image_model(model: &str) -> bool {
    model.contains("image-generation") || model.contains("-image")
}

fn block_reason_message(reason: &str) -> String {
    match reason {
        "SAFETY" => "Prompt was blocked due to safety reasons".to_string(),
        "OTHER" => "Prompt was blocked due to unknown reasons".to_string(),
        "BLOCKLIST" => "Prompt was blocked due to the terms which are included from the terminology blocklist".to_string(),
        "PROHIBITED_CONTENT" => "Prompt was blocked due to prohibited content".to_string(),
        "IMAGE_SAFETY" => "Candidates blocked due to unsafe image generation content".to_string(),
        other => other.to_string(),
    }
}

fn prompt_error(status: StatusCode, message: impl Into<String>) -> RelayError {
    RelayError::new(status, message, "prompt_error", status.as_u16())
}

fn marshal<T: serde::Serialize>(value: &T) -> Result<Value, RelayError> {
    serde_json::to_value(value).map_err(|e| {
        RelayError::wrap(e, "marshal_request_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
    })
}

fn api_version(meta: &RelayMeta) -> &str {
    if meta.config.api_version.is_empty() {
        DEFAULT_VERSION
    } else {
        &meta.config.api_version
    }
}

/// 流首帧或非流响应上的拦截检查
fn check_frame(frame: &ChatResponse) -> Result<(), RelayError> {
    if let Some(reason) = frame
        .prompt_feedback
        .as_ref()
        .map(|f| f.block_reason.as_str())
        .filter(|r| !r.is_empty())
    {
        return Err(prompt_error(StatusCode::FORBIDDEN, block_reason_message(reason)));
    }
    match frame
        .candidates
        .first()
        .map(|c| c.finish_reason.to_ascii_uppercase())
        .as_deref()
    {
        Some("MAX_TOKENS") => Err(prompt_error(StatusCode::BAD_REQUEST, NO_CANDIDATES)),
        Some("IMAGE_SAFETY") => Err(RelayError::new(
            StatusCode::FORBIDDEN,
            UNSAFE_IMAGE,
            "request_forbidden",
            403,
        )),
        _ => Ok(()),
    }
}

fn finish_reason(reason: &str, has_tools: bool) -> Option<String> {
    let reason = match reason.to_ascii_uppercase().as_str() {
        "" => return None,
        "STOP" if has_tools => "tool_calls",
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        _ => "content_filter",
    };
    Some(reason.to_string())
}

fn usage_from(metadata: UsageMetadata) -> Usage {
    let mut usage = Usage::new(metadata.prompt_token_count, metadata.candidates_token_count);
    if metadata.total_token_count > 0 {
        usage.total_tokens = metadata.total_token_count;
    }
    usage.thoughts_tokens = metadata.thoughts_token_count;
    usage
}

fn tool_call(call: FunctionCall, index: usize) -> Tool {
    Tool {
        index: Some(index),
        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
        kind: "function".to_string(),
        function: Function {
            name: call.name,
            arguments: Some(if call.args.is_null() {
                "{}".to_string()
            } else {
                call.args.to_string()
            }),
            ..Function::default()
        },
    }
}

fn image_markdown(index: usize, data: &InlineData) -> String {
    format!("![Image_{index}](data:{};base64,{})", data.mime_type, data.data)
}

/// 一个候选拆分出的推理、正文与工具调用
#[derive(Debug, Default)]
struct SplitParts {
    reasoning: String,
    content: String,
    tool_calls: Vec<Tool>,
}

fn split_parts(parts: Vec<Part>, separator: &str, first_tool_index: usize) -> SplitParts {
    let mut split = SplitParts::default();
    for (index, part) in parts.into_iter().enumerate() {
        if let Some(call) = part.function_call {
            let tool_index = first_tool_index + split.tool_calls.len();
            split.tool_calls.push(tool_call(call, tool_index));
        } else if let Some(data) = &part.inline_data {
            split.content.push_str(&image_markdown(index, data));
        } else if part.thought {
            split.reasoning.push_str(&part.text);
        } else if !part.text.is_empty() {
            if !split.content.is_empty() {
                split.content.push_str(separator);
            }
            split.content.push_str(&part.text);
        }
    }
    split
}

/// 非流式对话响应
fn chat_response(gemini: ChatResponse, meta: &RelayMeta) -> Result<(TextResponse, Usage), RelayError> {
    if gemini.candidates.is_empty() {
        check_frame(&gemini)?;
        return Err(RelayError::new(
            StatusCode::BAD_REQUEST,
            NO_CANDIDATES,
            "server_error",
            400,
        ));
    }
    check_frame(&gemini)?;
    let mut text = String::new();
    let mut choices = Vec::with_capacity(gemini.candidates.len());
    for (index, candidate) in gemini.candidates.into_iter().enumerate() {
        let empty = candidate.content.parts.is_empty();
        let split = split_parts(candidate.content.parts, "\n", 0);
        let (content, reasoning) = ReasoningInliner::inline_buffered(&meta.thinking, &split.reasoning, &split.content);
        text.push_str(&content);
        let finish_reason = if empty {
            candidate.finish_reason
        } else if split.tool_calls.is_empty() {
            "stop".to_string()
        } else {
            "tool_calls".to_string()
        };
        choices.push(TextChoice {
            index,
            message: Message {
                role: "assistant".to_string(),
                content: Value::String(content),
                tool_calls: split.tool_calls,
                reasoning_content: reasoning,
                ..Message::default()
            },
            finish_reason,
        });
    }
    let usage = settle_usage(gemini.usage_metadata.map(usage_from), &text, meta.prompt_tokens, &meta.actual_model);
    let response = TextResponse {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: meta.actual_model.clone(),
        choices,
        usage,
    };
    Ok((response, usage))
}

/// 流式翻译状态
struct StreamState {
    id: String,
    created: i64,
    model: String,
    prompt_tokens: i64,
    inliner: ReasoningInliner,
    tool_count: usize,
    text: String,
    usage: Option<UsageMetadata>,
}

impl StreamState {
    fn new(meta: &RelayMeta) -> Self {
        Self {
            id: completion_id(),
            created: unix_now(),
            model: meta.actual_model.clone(),
            prompt_tokens: meta.prompt_tokens,
            inliner: ReasoningInliner::new(meta.thinking.clone()),
            tool_count: 0,
            text: String::new(),
            usage: None,
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionsStreamResponse {
        ChatCompletionsStreamResponse::chunk(
            &self.id,
            self.created,
            &self.model,
            StreamChoice {
                index: 0,
                delta,
                finish_reason,
            },
        )
    }

    fn apply(&mut self, frame: ChatResponse) -> Option<ChatCompletionsStreamResponse> {
        if let Some(usage) = frame.usage_metadata {
            self.usage = Some(usage);
        }
        let candidate = frame.candidates.into_iter().next()?;
        let split = split_parts(candidate.content.parts, "", self.tool_count);
        self.tool_count += split.tool_calls.len();
        let finish = finish_reason(&candidate.finish_reason, self.tool_count > 0);

        let mut inlined = self.inliner.push(Some(split.reasoning.as_str()), Some(split.content.as_str()));
        if finish.is_some() {
            if let Some(tail) = self.inliner.finish() {
                inlined.content.get_or_insert_with(String::new).push_str(&tail);
            }
        }
        if let Some(content) = &inlined.content {
            self.text.push_str(content);
        }
        if let Some(reasoning) = &inlined.reasoning {
            self.text.push_str(reasoning);
        }
        if inlined.is_empty() && split.tool_calls.is_empty() && finish.is_none() {
            return None;
        }
        let delta = Delta {
            role: Some("assistant".to_string()),
            content: inlined.content,
            reasoning_content: inlined.reasoning,
            tool_calls: split.tool_calls,
            ..Delta::default()
        };
        Some(self.chunk(delta, finish))
    }

    /// 流结束时补齐未闭合的推理段
    fn finish(&mut self) -> Option<ChatCompletionsStreamResponse> {
        let tail = self.inliner.finish()?;
        self.text.push_str(&tail);
        Some(self.chunk(
            Delta {
                content: Some(tail),
                ..Delta::default()
            },
            None,
        ))
    }

    fn usage(&self) -> Usage {
        settle_usage(self.usage.map(usage_from), &self.text, self.prompt_tokens, &self.model)
    }
}

/// 读取下一个可解析的数据帧
async fn next_frame(lines: &mut UpstreamLines, request_id: &str) -> Option<ChatResponse> {
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                lwarn!(request_id, LogStage::Response, LogComponent::Adaptor, "stream_read_failed", "读取 Gemini 流失败", error = %e);
                return None;
            }
        };
        let Some(payload) = data_payload(&line) else {
            continue;
        };
        match serde_json::from_str(payload) {
            Ok(frame) => return Some(frame),
            Err(e) => {
                lwarn!(request_id, LogStage::Response, LogComponent::Adaptor, "stream_frame_invalid", "Gemini 流式帧解析失败", error = %e);
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct GeminiAdaptor {
    deps: AdaptorDeps,
    uploader: FileUploader,
    poll_interval: Duration,
}

impl GeminiAdaptor {
    #[must_use]
    pub fn new(deps: AdaptorDeps) -> Self {
        Self::with_poll_interval(deps, DEFAULT_POLL_INTERVAL)
    }

    /// 指定文件状态与视频任务的轮询间隔
    #[must_use]
    pub fn with_poll_interval(deps: AdaptorDeps, poll_interval: Duration) -> Self {
        Self {
            uploader: FileUploader::new(deps.clone(), poll_interval),
            deps,
            poll_interval,
        }
    }

    async fn image_part(&self, meta: &mut RelayMeta, url: &str) -> Result<Part, RelayError> {
        let is_media = self
            .deps
            .media
            .is_media_url(url)
            .await
            .map_err(|e| RelayError::wrap(e, "get_media_failed", StatusCode::BAD_REQUEST))?;
        if is_media {
            let file = self.uploader.resolve(meta, url).await?;
            return Ok(Part {
                file_data: Some(file),
                ..Part::default()
            });
        }
        let media = self
            .deps
            .media
            .fetch(url)
            .await
            .map_err(|e| RelayError::wrap(e, "get_image_failed", StatusCode::BAD_REQUEST))?;
        Ok(Part {
            inline_data: Some(InlineData {
                data: media.base64(),
                mime_type: media.mime_type,
            }),
            ..Part::default()
        })
    }

    async fn message_parts(&self, meta: &mut RelayMeta, message: &Message) -> Result<Vec<Part>, RelayError> {
        let mut parts = Vec::new();
        if message.role == "tool" {
            let text = message.string_content();
            parts.push(Part::text(if text.is_empty() { "Hi".to_string() } else { text }));
            return Ok(parts);
        }
        let mut images = 0;
        for part in message.parse_content() {
            match part {
                ContentPart::Text(text) => {
                    parts.push(Part::text(if text.is_empty() { "Hi".to_string() } else { text }));
                }
                ContentPart::ImageUrl(image) => {
                    images += 1;
                    if images > VISION_MAX_IMAGES {
                        continue;
                    }
                    parts.push(self.image_part(meta, &image.url).await?);
                }
            }
        }
        for call in &message.tool_calls {
            let args = call
                .function
                .arguments
                .as_deref()
                .and_then(|args| serde_json::from_str(args).ok())
                .unwrap_or_else(|| json!({}));
            parts.push(Part {
                function_call: Some(FunctionCall {
                    name: call.function.name.clone(),
                    args,
                }),
                ..Part::default()
            });
        }
        if parts.is_empty() {
            parts.push(Part::text("Hi"));
        }
        Ok(parts)
    }

    async fn convert_chat(&self, meta: &mut RelayMeta, request: &GeneralOpenAiRequest) -> Result<ChatRequest, RelayError> {
        let mut config = GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            max_output_tokens: Some(request.max_tokens).filter(|m| *m > 0),
            stop_sequences: request.stop.clone(),
            ..GenerationConfig::default()
        };
        if is_image_model(&meta.actual_model) {
            config.response_modalities = vec!["text".to_string(), "image".to_string()];
        }
        if let Some(thinking) = request.enabled_thinking() {
            config.thinking_config = Some(ThinkingConfig {
                thinking_budget: thinking.thinking_budget,
                include_thoughts: true,
            });
        }
        if let Some(format) = &request.response_format {
            match format.get("type").and_then(Value::as_str) {
                Some("json_object") => config.response_mime_type = "application/json".to_string(),
                Some("text") => config.response_mime_type = "text/plain".to_string(),
                _ => {}
            }
            let schema = format
                .get("json_schema")
                .and_then(|s| s.get("schema"))
                .or_else(|| format.get("schema"));
            if let Some(schema) = schema {
                config.response_schema = Some(schema.clone());
                config.response_mime_type = "application/json".to_string();
            }
        }

        let mut tools = Vec::new();
        let mut functions = Vec::new();
        for tool in &request.tools {
            if tool.kind == "google_search_tool" {
                tools.push(ChatTools {
                    google_search: Some(json!({})),
                    ..ChatTools::default()
                });
            } else {
                functions.push(marshal(&tool.function)?);
            }
        }
        if !functions.is_empty() {
            tools.push(ChatTools {
                function_declarations: Some(Value::Array(functions)),
                ..ChatTools::default()
            });
        }

        let mut contents = Vec::with_capacity(request.messages.len() + 1);
        let mut next_role = "user";
        for message in &request.messages {
            let parts = self.message_parts(meta, message).await?;
            let role = match message.role.as_str() {
                "assistant" | "system" => "model",
                "tool" => "user",
                other => other,
            };
            if role == "model" && next_role == "user" {
                contents.push(Content::text("user", "Hello"));
            } else if role == "user" && next_role == "model" {
                contents.push(Content::text("model", "Hi"));
            }
            contents.push(Content {
                role: role.to_string(),
                parts,
            });
            next_role = if role == "user" { "model" } else { "user" };
        }
        if next_role == "user" {
            contents.push(Content::text("user", "Hello"));
        }

        Ok(ChatRequest {
            contents,
            safety_settings: HARM_CATEGORIES
                .iter()
                .map(|category| SafetySetting {
                    category,
                    threshold: "BLOCK_NONE",
                })
                .collect(),
            generation_config: config,
            tools,
        })
    }

    async fn stream_output(&self, response: reqwest::Response, meta: &RelayMeta) -> Result<RelayOutput, RelayError> {
        let mut lines = upstream_lines(response);
        let first = next_frame(&mut lines, &meta.request_id).await;
        if let Some(frame) = &first {
            check_frame(frame)?;
        }
        let meta = meta.clone();
        Ok(spawn_stream(meta.request_id.clone(), move |mut writer| async move {
            let mut state = StreamState::new(&meta);
            let mut pending = first;
            loop {
                let frame = match pending.take() {
                    Some(frame) => frame,
                    None => match next_frame(&mut lines, &meta.request_id).await {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if let Some(chunk) = state.apply(frame) {
                    if !writer.send_json(&chunk).await {
                        break;
                    }
                }
            }
            if let Some(chunk) = state.finish() {
                writer.send_json(&chunk).await;
            }
            writer.done().await;
            writer.summary(state.usage())
        }))
    }

    async fn embedding_output(response: reqwest::Response, meta: &RelayMeta) -> Result<RelayOutput, RelayError> {
        let (status, _, body) = read_body(response).await?;
        let gemini: model::EmbeddingResponse = serde_json::from_slice(&body).map_err(|e| {
            RelayError::wrap(e, "unmarshal_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
        })?;
        if let Some(error) = gemini.error {
            return Err(RelayError::new(status, error.message, "gemini_error", error.code));
        }
        let usage = Usage::new(meta.prompt_tokens, 0);
        let openai = EmbeddingResponse {
            object: "list".to_string(),
            data: gemini
                .embeddings
                .into_iter()
                .enumerate()
                .map(|(index, item)| EmbeddingData {
                    object: "embedding".to_string(),
                    index,
                    embedding: item.values,
                })
                .collect(),
            model: "gemini-embedding".to_string(),
            usage,
        };
        Ok(RelayOutput::Complete {
            response: json_response(status, &openai)?,
            usage,
        })
    }

    async fn image_output(response: reqwest::Response, meta: &RelayMeta) -> Result<RelayOutput, RelayError> {
        let (status, _, body) = read_body(response).await?;
        let gemini: ChatResponse = serde_json::from_slice(&body).map_err(|e| {
            RelayError::wrap(e, "unmarshal_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
        })?;
        if gemini.candidates.is_empty() {
            return Err(RelayError::new(StatusCode::BAD_REQUEST, NO_CANDIDATES, "server_error", 500));
        }
        if gemini
            .candidates
            .first()
            .is_some_and(|c| c.finish_reason == "IMAGE_SAFETY")
        {
            return Err(RelayError::new(StatusCode::FORBIDDEN, UNSAFE_IMAGE, "request_forbidden", 403));
        }
        let mut images = Vec::new();
        let mut text = String::new();
        for part in gemini.candidates.into_iter().flat_map(|c| c.content.parts) {
            match part.inline_data {
                Some(data) => images.push(ImageData {
                    b64_json: data.data,
                    ..ImageData::default()
                }),
                None if !part.text.is_empty() => {
                    text.push('\n');
                    text.push_str(&part.text);
                }
                None => {}
            }
        }
        if images.is_empty() {
            return Err(RelayError::wrap(
                "Your prompt cannot generate an image, please adjust the prompt",
                "invalid_prompt",
                StatusCode::BAD_REQUEST,
            ));
        }
        if let Some(first) = images.first_mut() {
            first.revised_prompt = text.trim().to_string();
        }
        let usage = gemini
            .usage_metadata
            .map(usage_from)
            .unwrap_or_else(|| Usage::new(meta.prompt_tokens, 0));
        let openai = ImageResponse {
            created: unix_now(),
            data: images,
            usage: Some(usage),
        };
        Ok(RelayOutput::Complete {
            response: json_response(status, &openai)?,
            usage,
        })
    }

    async fn video_output(&self, response: reqwest::Response, meta: &RelayMeta) -> Result<RelayOutput, RelayError> {
        let (status, _, body) = read_body(response).await?;
        let operation: Operation = serde_json::from_slice(&body).map_err(|e| {
            RelayError::wrap(e, "unmarshal_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
        })?;
        if operation.name.is_empty() {
            return Err(RelayError::wrap("Uri is empty", "uri_is_empty", StatusCode::INTERNAL_SERVER_ERROR));
        }
        linfo!(&meta.request_id, LogStage::UpstreamRequest, LogComponent::Adaptor, "video_job_started", "视频任务已提交", operation = %operation.name);

        let url = format!("{}/{}/{}", meta.base_url, api_version(meta), operation.name);
        let mut uris = Vec::new();
        for _ in 0..VIDEO_POLLS {
            let polled = self
                .deps
                .clients
                .gemini
                .get(&url)
                .header("x-goog-api-key", &meta.api_key)
                .send()
                .await
                .map_err(|e| RelayError::wrap(e, "do_request_failed", StatusCode::INTERNAL_SERVER_ERROR))?;
            let (poll_status, _, poll_body) = read_body(polled).await?;
            if !poll_status.is_success() {
                return Err(RelayError::from_upstream(poll_status, &poll_body));
            }
            let job: Operation = serde_json::from_slice(&poll_body).map_err(|e| {
                RelayError::wrap(e, "unmarshal_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
            })?;
            if let Some(result) = job.response {
                uris.extend(
                    result
                        .generate_video_response
                        .generated_samples
                        .into_iter()
                        .map(|s| s.video.uri)
                        .filter(|u| !u.is_empty()),
                );
                if !uris.is_empty() {
                    break;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        if uris.is_empty() {
            return Err(RelayError::wrap("Uri is empty", "uri_is_empty", StatusCode::INTERNAL_SERVER_ERROR));
        }
        let video = VideoResponse {
            created: unix_now(),
            data: uris
                .into_iter()
                .map(|url| VideoData {
                    url,
                    ..VideoData::default()
                })
                .collect(),
            usage: None,
        };
        Ok(RelayOutput::Complete {
            response: json_response(status, &video)?,
            usage: Usage::default(),
        })
    }
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn client(&self) -> &reqwest::Client {
        &self.deps.clients.gemini
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String, RelayError> {
        let action = match meta.mode {
            RelayMode::Embeddings => "batchEmbedContents",
            RelayMode::VideoGenerations => "predictLongRunning",
            _ if meta.is_stream => "streamGenerateContent?alt=sse",
            _ => "generateContent",
        };
        Ok(format!(
            "{}/{}/models/{}:{action}",
            meta.base_url,
            api_version(meta),
            meta.actual_model
        ))
    }

    fn setup_headers(
        &self,
        headers: &mut HeaderMap,
        meta: &RelayMeta,
        _inbound: &HeaderMap,
    ) -> Result<(), RelayError> {
        headers.insert("x-goog-api-key", header_value(&meta.api_key)?);
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        Ok(())
    }

    async fn convert_text_request(
        &self,
        meta: &mut RelayMeta,
        request: GeneralOpenAiRequest,
    ) -> Result<Value, RelayError> {
        meta.thinking = ThinkingHints::from_request(request.enabled_thinking());
        meta.use_thinking = request.enabled_thinking().is_some();
        if meta.mode == RelayMode::Embeddings {
            let model = format!("models/{}", meta.actual_model);
            let batch = BatchEmbeddingRequest {
                requests: request
                    .parse_input()
                    .into_iter()
                    .map(|input| EmbeddingRequest {
                        model: model.clone(),
                        content: Content {
                            role: String::new(),
                            parts: vec![Part::text(input)],
                        },
                    })
                    .collect(),
            };
            return marshal(&batch);
        }
        let chat = self.convert_chat(meta, &request).await?;
        marshal(&chat)
    }

    async fn convert_image_request(
        &self,
        _meta: &mut RelayMeta,
        request: ImageRequest,
    ) -> Result<Value, RelayError> {
        let mut contents = Vec::new();
        if request.image.is_empty() {
            let n = request.n.unwrap_or(1).min(MAX_IMAGE_N);
            if n > 1 {
                contents.push(Content::text(
                    "user",
                    &format!("I will send you a prompt, please generate pictures according to the prompts, and you need to generate {n} different pictures"),
                ));
                contents.push(Content::text("model", "Ok"));
            }
            contents.push(Content::text("user", &request.prompt));
        } else {
            let mut parts = Vec::with_capacity(request.image.len() + 1);
            for image in &request.image {
                let media = self
                    .deps
                    .media
                    .fetch(image)
                    .await
                    .map_err(|e| RelayError::wrap(e, "get_image_failed", StatusCode::BAD_REQUEST))?;
                parts.push(Part {
                    inline_data: Some(InlineData {
                        data: media.base64(),
                        mime_type: media.mime_type,
                    }),
                    ..Part::default()
                });
            }
            parts.push(Part::text(request.prompt));
            contents.push(Content {
                role: "user".to_string(),
                parts,
            });
        }
        marshal(&ChatRequest {
            contents,
            generation_config: GenerationConfig {
                response_modalities: vec!["text".to_string(), "image".to_string()],
                ..GenerationConfig::default()
            },
            ..ChatRequest::default()
        })
    }

    async fn convert_video_request(
        &self,
        _meta: &mut RelayMeta,
        request: VideoRequest,
    ) -> Result<Value, RelayError> {
        let image = if request.image.is_empty() {
            None
        } else {
            let media = self
                .deps
                .media
                .fetch(&request.image)
                .await
                .map_err(|e| RelayError::wrap(e, "get_image_failed", StatusCode::BAD_REQUEST))?;
            Some(VideoImage {
                bytes_base64_encoded: media.base64(),
                mime_type: media.mime_type,
            })
        };
        marshal(&model::VideoRequest {
            instances: vec![VideoInstance {
                prompt: request.prompt,
                image,
            }],
            parameters: VideoParameters {
                sample_count: request.n.filter(|n| *n > 0),
                negative_prompt: request.negative_prompt,
                aspect_ratio: request.size,
                person_generation: "allow_adult".to_string(),
                duration_seconds: request.duration.filter(|d| *d > 0),
            },
        })
    }

    async fn error_response(&self, response: reqwest::Response, meta: &mut RelayMeta) -> RelayError {
        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return RelayError::wrap(e, "read_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        let parsed = serde_json::from_slice::<ErrorResponse>(&body)
            .ok()
            .and_then(|r| r.error);
        if let Some(error) = parsed {
            if status == StatusCode::TOO_MANY_REQUESTS && !error.details.is_empty() {
                let delay = error
                    .details
                    .iter()
                    .find(|d| !d.retry_delay.is_empty())
                    .and_then(|d| DIGITS.as_ref()?.find(&d.retry_delay))
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(DEFAULT_RETRY_DELAY);
                meta.hints.gemini_delay = Some(delay);
                return RelayError::wrap(
                    "Resource has been exhausted",
                    "too_many_requests",
                    StatusCode::TOO_MANY_REQUESTS,
                );
            }
            if status == StatusCode::BAD_REQUEST
                && error.message.contains("File ")
                && error.message.contains("not exist in the Gemini API.")
            {
                if let Some(uri) = URL_IN_MESSAGE
                    .as_ref()
                    .and_then(|re| re.find(&error.message))
                    .map(|m| m.as_str().to_string())
                {
                    match self.deps.repo.delete_file_by_file_id(&uri).await {
                        Ok(rows) => {
                            linfo!(&meta.request_id, LogStage::ResponseFailure, LogComponent::Adaptor, "stale_file_deleted", "已删除失效文件记录", file_uri = %uri, rows = rows);
                        }
                        Err(e) => {
                            lwarn!(&meta.request_id, LogStage::ResponseFailure, LogComponent::Adaptor, "stale_file_delete_failed", "删除失效文件记录失败", file_uri = %uri, error = %e);
                        }
                    }
                }
                return RelayError::wrap("File not exist", "bad_requests", StatusCode::BAD_REQUEST);
            }
        }
        RelayError::from_upstream(status, &body)
    }

    async fn do_response(
        &self,
        response: reqwest::Response,
        meta: &mut RelayMeta,
    ) -> Result<RelayOutput, RelayError> {
        match meta.mode {
            RelayMode::Embeddings => Self::embedding_output(response, meta).await,
            RelayMode::ImagesGenerations | RelayMode::ImagesEdits => Self::image_output(response, meta).await,
            RelayMode::VideoGenerations => self.video_output(response, meta).await,
            _ if meta.is_stream => self.stream_output(response, meta).await,
            _ => {
                let (status, _, body) = read_body(response).await?;
                let gemini: ChatResponse = serde_json::from_slice(&body).map_err(|e| {
                    RelayError::wrap(e, "unmarshal_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
                })?;
                let (text, usage) = chat_response(gemini, meta)?;
                Ok(RelayOutput::Complete {
                    response: json_response(status, &text)?,
                    usage,
                })
            }
        }
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }
}
