//! # Anthropic 适配器
//!
//! OpenAI 对话请求与 Claude Messages API 之间的双向转换

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Adaptor, RelayOutput, header_value, spawn_stream};
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;
use crate::relay::client::{HttpClients, MediaFetcher};
use crate::relay::meta::RelayMeta;
use crate::relay::model::{
    ChatCompletionsStreamResponse, ContentPart, Delta, Function, GeneralOpenAiRequest, Message,
    StreamChoice, TextChoice, TextResponse, Tool, Usage,
};
use crate::relay::response::{completion_id, json_response, read_body, unix_now};
use crate::relay::sse::{data_payload, upstream_lines};
use crate::relay::thinking::{ReasoningInliner, ThinkingHints};
use crate::relay::tools::ToolCallAccumulator;

const DEFAULT_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i64 = 4096;
const DEFAULT_THINKING_BUDGET: i64 = 1024;

const MODELS: &[&str] = &[
    "claude-instant-1.2",
    "claude-2.0",
    "claude-2.1",
    "claude-3-haiku-20240307",
    "claude-3-sonnet-20240229",
    "claude-3-opus-20240229",
    "claude-3-5-sonnet-20240620",
    "claude-3-5-haiku-20241022",
    "claude-3-5-sonnet-20241022",
    "claude-3-5-sonnet-latest",
    "claude-3-7-sonnet-20250219",
    "claude-3-7-sonnet-latest",
    "claude-opus-4-20250514",
    "claude-sonnet-4-20250514",
    "claude-opus-4-1-20250805",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: String,
    media_type: String,
    data: String,
}

/// 消息内容块
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Content {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<ImageSource>,
    #[serde(skip_serializing_if = "String::is_empty")]
    id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    tool_use_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    thinking: String,
}

impl Content {
    fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ClaudeMessage {
    role: String,
    content: Vec<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct InputSchema {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    required: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ClaudeTool {
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    description: String,
    input_schema: InputSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ToolChoice {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ClaudeThinking {
    #[serde(rename = "type")]
    kind: String,
    budget_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ClaudeRequest {
    model: String,
    messages: Vec<ClaudeMessage>,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    max_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ClaudeTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ClaudeThinking>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
struct ClaudeUsage {
    input_tokens: i64,
    output_tokens: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
struct ClaudeError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
struct ClaudeResponse {
    id: String,
    model: String,
    content: Vec<Content>,
    stop_reason: Option<String>,
    usage: ClaudeUsage,
    error: ClaudeError,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
struct StreamDelta {
    #[serde(rename = "type")]
    kind: String,
    text: String,
    partial_json: String,
    thinking: String,
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    message: Option<ClaudeResponse>,
    content_block: Option<Content>,
    delta: Option<StreamDelta>,
    usage: Option<ClaudeUsage>,
}

/// Claude 停止原因到 OpenAI `finish_reason`
fn stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

/// 旧模型名改写
fn legacy_model(model: &str) -> String {
    match model {
        "claude-instant-1" => "claude-instant-1.1".to_string(),
        "claude-2" => "claude-2.1".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicAdaptor {
    clients: Arc<HttpClients>,
    media: MediaFetcher,
}

impl AnthropicAdaptor {
    #[must_use]
    pub const fn new(clients: Arc<HttpClients>, media: MediaFetcher) -> Self {
        Self { clients, media }
    }

    fn convert_tools(request: &GeneralOpenAiRequest) -> (Vec<ClaudeTool>, Option<ToolChoice>) {
        let tools: Vec<ClaudeTool> = request
            .tools
            .iter()
            .filter_map(|tool| {
                let params = tool.function.parameters.as_ref()?.as_object()?;
                Some(ClaudeTool {
                    name: tool.function.name.clone(),
                    description: tool.function.description.clone(),
                    input_schema: InputSchema {
                        kind: params
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("object")
                            .to_string(),
                        properties: params.get("properties").cloned(),
                        required: params.get("required").cloned(),
                    },
                })
            })
            .collect();
        if tools.is_empty() {
            return (tools, None);
        }
        let mut choice = ToolChoice {
            kind: "auto".to_string(),
            name: String::new(),
        };
        match &request.tool_choice {
            Some(Value::Object(map)) => {
                if let Some(name) = map
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                {
                    choice.kind = "tool".to_string();
                    choice.name = name.to_string();
                }
            }
            Some(Value::String(kind)) if kind == "any" => choice.kind = kind.clone(),
            _ => {}
        }
        (tools, Some(choice))
    }

    async fn convert_content(&self, message: &Message) -> Result<Vec<Content>, RelayError> {
        let mut contents = Vec::new();
        for part in message.parse_content() {
            match part {
                ContentPart::Text(text) => contents.push(Content::text(text)),
                ContentPart::ImageUrl(image) => {
                    let media = self.media.fetch(&image.url).await.map_err(|e| {
                        RelayError::wrap(e, "get_image_failed", StatusCode::BAD_REQUEST)
                    })?;
                    contents.push(Content {
                        kind: "image".to_string(),
                        source: Some(ImageSource {
                            kind: "base64".to_string(),
                            data: media.base64(),
                            media_type: media.mime_type,
                        }),
                        ..Content::default()
                    });
                }
            }
        }
        Ok(contents)
    }

    async fn convert_request(&self, request: &GeneralOpenAiRequest) -> Result<ClaudeRequest, RelayError> {
        let (tools, tool_choice) = Self::convert_tools(request);
        let thinking = request.enabled_thinking().map(|t| ClaudeThinking {
            kind: "enabled".to_string(),
            budget_tokens: t
                .thinking_budget
                .filter(|b| *b > 0)
                .unwrap_or(DEFAULT_THINKING_BUDGET),
        });
        let stop_sequences = match &request.stop {
            Some(Value::String(stop)) => Some(vec![stop.clone()]),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        };
        let mut claude = ClaudeRequest {
            model: legacy_model(&request.model),
            messages: Vec::new(),
            system: String::new(),
            max_tokens: if request.max_tokens == 0 {
                DEFAULT_MAX_TOKENS
            } else {
                request.max_tokens
            },
            stop_sequences,
            stream: request.stream,
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            tools,
            tool_choice,
            thinking,
        };

        let mut next_role = "user";
        for (index, message) in request.messages.iter().enumerate() {
            if message.role == "system" && claude.system.is_empty() {
                claude.system = message.string_content();
                continue;
            }
            let mut role = if message.role == "system" && index != 0 {
                "assistant".to_string()
            } else {
                message.role.clone()
            };
            let content = if message.is_string_content() {
                let mut content = Content::text(message.string_content());
                if message.role == "tool" {
                    role = "user".to_string();
                    content.kind = "tool_result".to_string();
                    content.content = Some(std::mem::take(&mut content.text));
                    content.tool_use_id = message.tool_call_id.clone().unwrap_or_default();
                }
                let mut contents = vec![content];
                for call in &message.tool_calls {
                    let input = call
                        .function
                        .arguments
                        .as_deref()
                        .and_then(|args| serde_json::from_str::<Value>(args).ok())
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                    contents.push(Content {
                        kind: "tool_use".to_string(),
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: Some(input),
                        ..Content::default()
                    });
                }
                contents
            } else {
                self.convert_content(message).await?
            };

            if role == "assistant" && next_role == "user" {
                claude.messages.push(ClaudeMessage {
                    role: "user".to_string(),
                    content: vec![Content::text("Please remember what i said")],
                });
            } else if role == "user" && next_role == "assistant" {
                claude.messages.push(ClaudeMessage {
                    role: "assistant".to_string(),
                    content: vec![Content::text("OK, I have remembered what you said")],
                });
            }
            next_role = if role == "user" { "assistant" } else { "user" };
            claude.messages.push(ClaudeMessage { role, content });
        }
        Ok(claude)
    }
}

/// 非流式响应翻译
fn text_response(claude: ClaudeResponse, meta: &RelayMeta) -> (TextResponse, Usage) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for item in &claude.content {
        match item.kind.as_str() {
            "thinking" => reasoning.push_str(&item.thinking),
            "tool_use" => tool_calls.push(Tool {
                index: None,
                id: item.id.clone(),
                kind: "function".to_string(),
                function: Function {
                    name: item.name.clone(),
                    arguments: Some(
                        item.input
                            .as_ref()
                            .map_or_else(|| "{}".to_string(), Value::to_string),
                    ),
                    ..Function::default()
                },
            }),
            _ => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&item.text);
            }
        }
    }
    let (content, reasoning_content) = ReasoningInliner::inline_buffered(&meta.thinking, &reasoning, &text);
    let usage = Usage::new(claude.usage.input_tokens, claude.usage.output_tokens);
    let response = TextResponse {
        id: format!("chatcmpl-{}", claude.id),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: meta.actual_model.clone(),
        choices: vec![TextChoice {
            index: 0,
            message: Message {
                role: "assistant".to_string(),
                content: Value::String(content),
                tool_calls,
                reasoning_content,
                ..Message::default()
            },
            finish_reason: claude.stop_reason.as_deref().map(stop_reason).unwrap_or_default(),
        }],
        usage,
    };
    (response, usage)
}

/// 单个流事件翻译出的增量
#[derive(Debug, Default)]
struct EventDelta {
    text: Option<String>,
    reasoning: Option<String>,
    tool_calls: Vec<Tool>,
    finish_reason: Option<String>,
}

/// 流式翻译状态
struct StreamState {
    id: String,
    model: String,
    created: i64,
    usage: Usage,
    inliner: ReasoningInliner,
    tools: ToolCallAccumulator,
}

impl StreamState {
    fn new(meta: &RelayMeta) -> Self {
        Self {
            id: completion_id(),
            model: meta.actual_model.clone(),
            created: unix_now(),
            usage: Usage::default(),
            inliner: ReasoningInliner::new(meta.thinking.clone()),
            tools: ToolCallAccumulator::new(),
        }
    }

    /// 处理一个事件，返回需要写出的帧
    fn apply(&mut self, event: StreamEvent) -> Option<ChatCompletionsStreamResponse> {
        let mut delta = EventDelta::default();
        match event.kind.as_str() {
            "message_start" => {
                if let Some(message) = event.message {
                    self.usage.prompt_tokens += message.usage.input_tokens;
                    self.usage.completion_tokens += message.usage.output_tokens;
                    if !message.id.is_empty() {
                        self.id = format!("chatcmpl-{}", message.id);
                    }
                    if !message.model.is_empty() {
                        self.model = message.model;
                    }
                }
                return None;
            }
            "content_block_start" => {
                let block = event.content_block?;
                if block.kind == "tool_use" {
                    let index = self.tools.start(&block.id, &block.name);
                    delta.tool_calls.push(Tool {
                        index: Some(index),
                        id: block.id,
                        kind: "function".to_string(),
                        function: Function {
                            name: block.name,
                            arguments: Some(String::new()),
                            ..Function::default()
                        },
                    });
                } else if !block.text.is_empty() {
                    delta.text = Some(block.text);
                }
            }
            "content_block_delta" => {
                let inner = event.delta?;
                match inner.kind.as_str() {
                    "input_json_delta" => {
                        let index = self.tools.append_arguments(&inner.partial_json)?;
                        delta.tool_calls.push(Tool {
                            index: Some(index),
                            function: Function {
                                arguments: Some(inner.partial_json),
                                ..Function::default()
                            },
                            ..Tool::default()
                        });
                    }
                    "thinking_delta" => delta.reasoning = Some(inner.thinking),
                    // 签名不可读，只保留换行
                    "signature_delta" => delta.reasoning = Some("\n".to_string()),
                    _ => delta.text = Some(inner.text),
                }
            }
            "message_delta" => {
                if let Some(usage) = event.usage {
                    self.usage.prompt_tokens += usage.input_tokens;
                    self.usage.completion_tokens += usage.output_tokens;
                }
                if let Some(reason) = event.delta.and_then(|d| d.stop_reason) {
                    delta.finish_reason = Some(stop_reason(&reason));
                    delta.tool_calls = self.tools.finish();
                }
            }
            _ => return None,
        }
        self.frame(delta)
    }

    fn frame(&mut self, delta: EventDelta) -> Option<ChatCompletionsStreamResponse> {
        let mut inlined = self.inliner.push(delta.reasoning.as_deref(), delta.text.as_deref());
        if delta.finish_reason.is_some() {
            if let Some(tail) = self.inliner.finish() {
                inlined.content.get_or_insert_with(String::new).push_str(&tail);
            }
        }
        if inlined.is_empty() && delta.tool_calls.is_empty() && delta.finish_reason.is_none() {
            return None;
        }
        // 工具调用帧仍携带推理段的收尾文本
        let out = Delta {
            role: Some("assistant".to_string()),
            content: inlined.content,
            reasoning_content: inlined.reasoning,
            tool_calls: delta.tool_calls,
            ..Delta::default()
        };
        Some(ChatCompletionsStreamResponse::chunk(
            &self.id,
            self.created,
            &self.model,
            StreamChoice {
                index: 0,
                delta: out,
                finish_reason: delta.finish_reason,
            },
        ))
    }
}

fn stream_response(response: reqwest::Response, meta: &RelayMeta) -> RelayOutput {
    let meta = meta.clone();
    spawn_stream(meta.request_id.clone(), move |mut writer| async move {
        let mut lines = upstream_lines(response);
        let mut state = StreamState::new(&meta);
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    lwarn!(&meta.request_id, LogStage::Response, LogComponent::Adaptor, "stream_read_failed", "读取 Claude 流失败", error = %e);
                    break;
                }
            };
            let Some(payload) = data_payload(&line) else {
                continue;
            };
            let event: StreamEvent = match serde_json::from_str(payload) {
                Ok(event) => event,
                Err(e) => {
                    lwarn!(&meta.request_id, LogStage::Response, LogComponent::Adaptor, "stream_frame_invalid", "Claude 流式帧解析失败", error = %e);
                    continue;
                }
            };
            if let Some(frame) = state.apply(event) {
                if !writer.send_json(&frame).await {
                    break;
                }
            }
        }
        if let Some(tail) = state.inliner.finish() {
            let frame = ChatCompletionsStreamResponse::chunk(
                &state.id,
                state.created,
                &state.model,
                StreamChoice {
                    delta: Delta {
                        content: Some(tail),
                        ..Delta::default()
                    },
                    ..StreamChoice::default()
                },
            );
            writer.send_json(&frame).await;
        }
        writer.done().await;
        let usage = Usage::new(state.usage.prompt_tokens, state.usage.completion_tokens);
        writer.summary(usage)
    })
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn client(&self) -> &reqwest::Client {
        &self.clients.relay
    }

    fn request_url(&self, meta: &RelayMeta) -> Result<String, RelayError> {
        Ok(format!("{}/v1/messages", meta.base_url))
    }

    fn setup_headers(
        &self,
        headers: &mut HeaderMap,
        meta: &RelayMeta,
        inbound: &HeaderMap,
    ) -> Result<(), RelayError> {
        headers.insert("x-api-key", header_value(&meta.api_key)?);
        let version = match inbound.get("anthropic-version") {
            Some(version) => version.clone(),
            None if meta.config.api_version.is_empty() => HeaderValue::from_static(DEFAULT_VERSION),
            None => header_value(&meta.config.api_version)?,
        };
        headers.insert("anthropic-version", version);
        let beta = if meta.actual_model.starts_with("claude-3-5-sonnet") {
            "max-tokens-3-5-sonnet-2024-07-15"
        } else {
            "messages-2023-12-15"
        };
        headers.insert("anthropic-beta", HeaderValue::from_static(beta));
        Ok(())
    }

    async fn convert_text_request(
        &self,
        meta: &mut RelayMeta,
        mut request: GeneralOpenAiRequest,
    ) -> Result<Value, RelayError> {
        meta.thinking = ThinkingHints::from_request(request.enabled_thinking());
        meta.use_thinking = request.enabled_thinking().is_some();
        request.model.clone_from(&meta.actual_model);
        let claude = self.convert_request(&request).await?;
        serde_json::to_value(&claude).map_err(|e| {
            RelayError::wrap(e, "marshal_request_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
        })
    }

    async fn do_response(
        &self,
        response: reqwest::Response,
        meta: &mut RelayMeta,
    ) -> Result<RelayOutput, RelayError> {
        if meta.is_stream {
            return Ok(stream_response(response, meta));
        }
        let (status, _, body) = read_body(response).await?;
        let claude: ClaudeResponse = serde_json::from_slice(&body).map_err(|e| {
            RelayError::wrap(e, "unmarshal_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
        })?;
        if !claude.error.kind.is_empty() {
            return Err(RelayError::new(
                status,
                claude.error.message,
                claude.error.kind.clone(),
                claude.error.kind,
            ));
        }
        let (text, usage) = text_response(claude, meta);
        Ok(RelayOutput::Complete {
            response: json_response(status, &text)?,
            usage,
        })
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;
    use crate::cache::KvStore;
    use crate::channel::ChannelKind;
    use crate::config::RelayConfig;
    use crate::relay::model::{Thinking, ThinkingTag};
    use crate::testing::fixtures;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adaptor() -> AnthropicAdaptor {
        let clients = Arc::new(HttpClients::from_config(&RelayConfig::default()).unwrap());
        let media = MediaFetcher::new(clients.clone(), Arc::new(KvStore::memory()));
        AnthropicAdaptor::new(clients, media)
    }

    fn meta(base_url: &str, model: &str) -> RelayMeta {
        let mut channel = fixtures::channel(2, ChannelKind::Anthropic, 0, &[model]);
        channel.base_url = base_url.to_string();
        channel.key = "ak-test".to_string();
        let auth = AuthContext {
            request_model: model.to_string(),
            ..AuthContext::default()
        };
        RelayMeta::new(&auth, &channel, "rid", "/v1/chat/completions")
    }

    fn request(value: Value) -> GeneralOpenAiRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_convert_system_padding_and_defaults() {
        let adaptor = adaptor();
        let mut meta = meta("http://x", "claude-2");
        let body = adaptor
            .convert_text_request(
                &mut meta,
                request(json!({
                    "model": "claude-2",
                    "messages": [
                        {"role": "system", "content": "be brief"},
                        {"role": "assistant", "content": "hello"},
                        {"role": "user", "content": "hi"},
                        {"role": "user", "content": "again"}
                    ]
                })),
            )
            .await
            .unwrap();
        assert_eq!(body["model"], "claude-2.1");
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["max_tokens"], 4096);
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, ["user", "assistant", "user", "assistant", "user"]);
        assert_eq!(body["messages"][0]["content"][0]["text"], "Please remember what i said");
        assert_eq!(
            body["messages"][3]["content"][0]["text"],
            "OK, I have remembered what you said"
        );
    }

    #[tokio::test]
    async fn test_convert_tools_and_thinking() {
        let adaptor = adaptor();
        let mut meta = meta("http://x", "claude-3-7-sonnet-20250219");
        let mut req = request(json!({
            "model": "claude-3-7-sonnet-20250219",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": "", "tool_calls": [{"id": "t1", "type": "function", "function": {"name": "get", "arguments": "{\"city\":\"x\"}"}}]},
                {"role": "tool", "tool_call_id": "t1", "content": "sunny"}
            ],
            "tools": [{"type": "function", "function": {"name": "get", "parameters": {"type": "object", "properties": {}}}}],
            "tool_choice": {"type": "function", "function": {"name": "get"}}
        }));
        req.thinking = Some(Thinking {
            kind: "enabled".to_string(),
            include_thinking: true,
            thinking_tag: Some(ThinkingTag {
                start: "<r>".to_string(),
                ..ThinkingTag::default()
            }),
            ..Thinking::default()
        });
        let body = adaptor.convert_text_request(&mut meta, req).await.unwrap();
        assert_eq!(body["thinking"]["budget_tokens"], 1024);
        assert_eq!(body["tool_choice"]["type"], "tool");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["messages"][1]["content"][1]["type"], "tool_use");
        assert_eq!(body["messages"][1]["content"][1]["input"]["city"], "x");
        assert_eq!(body["messages"][2]["role"], "user");
        assert_eq!(body["messages"][2]["content"][0]["type"], "tool_result");
        assert!(meta.thinking.include);
        assert_eq!(meta.thinking.start, "<r>");
    }

    #[tokio::test]
    async fn test_headers_follow_model() {
        let adaptor = adaptor();
        let meta = meta("http://x", "claude-3-5-sonnet-20240620");
        let mut headers = HeaderMap::new();
        adaptor.setup_headers(&mut headers, &meta, &HeaderMap::new()).unwrap();
        assert_eq!(headers["x-api-key"], "ak-test");
        assert_eq!(headers["anthropic-version"], "2023-06-01");
        assert_eq!(headers["anthropic-beta"], "max-tokens-3-5-sonnet-2024-07-15");
    }

    fn event(value: Value) -> StreamEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_stream_inlines_thinking_in_order() {
        let mut meta = meta("http://x", "claude-3-7-sonnet-20250219");
        meta.thinking = ThinkingHints {
            include: true,
            ..ThinkingHints::default()
        };
        let mut state = StreamState::new(&meta);
        let events = [
            json!({"type": "message_start", "message": {"id": "m1", "model": "claude-3-7", "usage": {"input_tokens": 10, "output_tokens": 1}}}),
            json!({"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "r1"}}),
            json!({"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "r2"}}),
            json!({"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "r3"}}),
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "t1"}}),
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "t2"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 20}}),
            json!({"type": "message_stop"}),
        ];
        let frames: Vec<_> = events.into_iter().filter_map(|e| state.apply(event(e))).collect();
        let content: String = frames
            .iter()
            .filter_map(|f| f.choices[0].delta.content.clone())
            .collect();
        assert_eq!(content, "<think>r1r2r3</think>t1t2");
        assert_eq!(frames.last().unwrap().choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(frames[0].id, "chatcmpl-m1");
        assert_eq!(state.usage.prompt_tokens, 10);
        assert_eq!(state.usage.completion_tokens, 21);
    }

    #[test]
    fn test_stream_empty_tool_arguments_finish_as_object() {
        let meta = meta("http://x", "claude-3-5-haiku-20241022");
        let mut state = StreamState::new(&meta);
        let start = state
            .apply(event(json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "call_1", "name": "now"}})))
            .unwrap();
        assert_eq!(start.choices[0].delta.tool_calls[0].function.name, "now");
        let finish = state
            .apply(event(json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}})))
            .unwrap();
        let call = &finish.choices[0].delta.tool_calls[0];
        assert_eq!(call.function.arguments.as_deref(), Some("{}"));
        assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("tool_calls"));
    }

    #[rstest::rstest]
    #[case::streaming(false)]
    #[case::block(true)]
    fn test_stream_closes_thinking_before_bare_tool_call(#[case] block_tag: bool) {
        let mut meta = meta("http://x", "claude-3-7-sonnet-20250219");
        meta.thinking = ThinkingHints {
            include: true,
            block_tag,
            ..ThinkingHints::default()
        };
        let mut state = StreamState::new(&meta);
        let events = [
            json!({"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "plan"}}),
            json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "call_1", "name": "now"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
        ];
        let frames: Vec<_> = events.into_iter().filter_map(|e| state.apply(event(e))).collect();
        let content: String = frames
            .iter()
            .filter_map(|f| f.choices[0].delta.content.clone())
            .collect();
        assert_eq!(content, "<think>plan</think>");
        let last = frames.last().unwrap();
        assert_eq!(last.choices[0].delta.tool_calls[0].function.arguments.as_deref(), Some("{}"));
        assert_eq!(state.inliner.finish(), None);
    }

    #[tokio::test]
    async fn test_buffered_response_translation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ak-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "model": "claude-3-5-haiku-20241022",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "done"}
                ],
                "stop_reason": "max_tokens",
                "usage": {"input_tokens": 5, "output_tokens": 7}
            })))
            .mount(&server)
            .await;
        let adaptor = adaptor();
        let mut meta = meta(&server.uri(), "claude-3-5-haiku-20241022");
        let upstream = adaptor
            .do_request(&mut meta, bytes::Bytes::from_static(b"{}"), &HeaderMap::new())
            .await
            .unwrap();
        let RelayOutput::Complete { response, usage } = adaptor.do_response(upstream, &mut meta).await.unwrap() else {
            panic!("expected complete");
        };
        assert_eq!(usage, Usage::new(5, 7));
        let body: Value = serde_json::from_slice(
            &axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap(),
        )
        .unwrap();
        assert_eq!(body["id"], "chatcmpl-msg_1");
        assert_eq!(body["choices"][0]["message"]["content"], "done");
        assert_eq!(body["choices"][0]["message"]["reasoning_content"], "hmm");
        assert_eq!(body["choices"][0]["finish_reason"], "length");
    }
}
