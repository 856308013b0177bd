//! # OpenRouter 适配器
//!
//! OpenAI 兼容线协议；Claude 系列模型改写为 `anthropic/...` 并固定提供方顺序

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode, header};
use serde_json::{Value, json};

use super::openai::{buffered_text, passthrough_output, stream_chat};
use super::{Adaptor, RelayOutput, header_value};
use crate::error::RelayError;
use crate::relay::client::HttpClients;
use crate::relay::meta::RelayMeta;
use crate::relay::mode::RelayMode;
use crate::relay::model::{GeneralOpenAiRequest, ImageRequest, VideoRequest};
use crate::relay::response::read_body;
use crate::relay::thinking::ThinkingHints;

const DEFAULT_REASONING_TOKENS: i64 = 2000;

const MODELS: &[&str] = &[
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

const MODEL_MAPPING: &[(&str, &str)] = &[
    ("claude-3-haiku-20240307", "anthropic/claude-3-5-haiku-20241022"),
    ("claude-3-sonnet-20240229", "anthropic/claude-3-5-sonnet-20241022"),
    ("claude-3-opus-20240229", "anthropic/claude-3-opus-20240229"),
    ("claude-3-5-haiku-20241022", "anthropic/claude-3-5-haiku-20241022"),
    ("claude-3-5-sonnet-20241022", "anthropic/claude-3-5-sonnet-20241022"),
    ("claude-3-5-sonnet-latest", "anthropic/claude-3-5-sonnet-20241022"),
    ("claude-3-7-sonnet-20250219", "anthropic/claude-3-7-sonnet-20250219"),
    ("claude-3-7-sonnet-latest", "anthropic/claude-3-7-sonnet-20250219"),
    ("claude-opus-4-20250514", "anthropic/claude-opus-4"),
    ("claude-sonnet-4-20250514", "anthropic/claude-sonnet-4"),
    ("claude-opus-4-1-20250805", "anthropic/claude-opus-4.1"),
];

/// OpenRouter 上的模型名
fn routed_model(model: &str) -> Option<&'static str> {
    MODEL_MAPPING
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, routed)| *routed)
}

fn marshal<T: serde::Serialize>(value: &T) -> Result<Value, RelayError> {
    serde_json::to_value(value).map_err(|e| {
        RelayError::wrap(e, "marshal_request_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
    })
}

#[derive(Debug, Clone)]
pub struct OpenRouterAdaptor {
    clients: Arc<HttpClients>,
}

impl OpenRouterAdaptor {
    #[must_use]
    pub const fn new(clients: Arc<HttpClients>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl Adaptor for OpenRouterAdaptor {
    fn name(&self) -> &'static str {
        "openrouter"
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
        request.model.clone_from(&meta.actual_model);
        let thinking = request.thinking.take();
        if let Some(routed) = routed_model(&request.model) {
            let provider = routed.split('/').next().unwrap_or_default().to_string();
            request.model = routed.to_string();
            request.provider = Some(json!({ "order": [provider] }));
            if provider == "anthropic" {
                if let Some(thinking) = thinking.as_ref().filter(|t| t.enabled()) {
                    let budget = thinking
                        .thinking_budget
                        .filter(|b| *b > 0)
                        .unwrap_or(DEFAULT_REASONING_TOKENS);
                    request.reasoning = Some(json!({ "max_tokens": budget }));
                    meta.thinking = ThinkingHints::from_request(Some(thinking));
                    meta.use_thinking = true;
                }
            }
            meta.hints.provider = Some(provider);
        }
        marshal(&request)
    }

    async fn convert_image_request(
        &self,
        meta: &mut RelayMeta,
        mut request: ImageRequest,
    ) -> Result<Value, RelayError> {
        request.model.clone_from(&meta.actual_model);
        marshal(&request)
    }

    async fn convert_video_request(
        &self,
        meta: &mut RelayMeta,
        mut request: VideoRequest,
    ) -> Result<Value, RelayError> {
        request.model.clone_from(&meta.actual_model);
        marshal(&request)
    }

    async fn do_response(
        &self,
        response: reqwest::Response,
        meta: &mut RelayMeta,
    ) -> Result<RelayOutput, RelayError> {
        if meta.is_stream {
            return Ok(stream_chat(response, meta, true));
        }
        match meta.mode {
            RelayMode::ImagesGenerations | RelayMode::ImagesEdits | RelayMode::VideoGenerations => {
                passthrough_output(response, meta).await
            }
            _ => {
                let (status, _, body) = read_body(response).await?;
                buffered_text(status, &body, meta)
            }
        }
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODELS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;
    use crate::channel::ChannelKind;
    use crate::config::RelayConfig;
    use crate::relay::model::Thinking;
    use crate::testing::fixtures;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adaptor() -> OpenRouterAdaptor {
        OpenRouterAdaptor::new(Arc::new(HttpClients::from_config(&RelayConfig::default()).unwrap()))
    }

    fn meta(base_url: &str, model: &str) -> RelayMeta {
        let mut channel = fixtures::channel(4, ChannelKind::OpenRouter, 0, &[model]);
        channel.base_url = base_url.to_string();
        let auth = AuthContext {
            request_model: model.to_string(),
            ..AuthContext::default()
        };
        RelayMeta::new(&auth, &channel, "rid", "/v1/chat/completions")
    }

    fn thinking(budget: Option<i64>) -> Thinking {
        Thinking {
            kind: "enabled".to_string(),
            thinking_budget: budget,
            include_thinking: true,
            thinking_tag: None,
        }
    }

    #[tokio::test]
    async fn test_claude_models_route_to_anthropic() {
        let mut meta = meta("http://x", "claude-opus-4-20250514");
        let request = GeneralOpenAiRequest {
            model: "claude-opus-4-20250514".to_string(),
            thinking: Some(thinking(None)),
            ..GeneralOpenAiRequest::default()
        };
        let body = adaptor().convert_text_request(&mut meta, request).await.unwrap();
        assert_eq!(body["model"], "anthropic/claude-opus-4");
        assert_eq!(body["provider"]["order"][0], "anthropic");
        assert_eq!(body["reasoning"]["max_tokens"], 2000);
        assert!(body.get("thinking").is_none());
        assert!(meta.thinking.include);
        assert!(meta.use_thinking);
        assert_eq!(meta.hints.provider.as_deref(), Some("anthropic"));
    }

    #[tokio::test]
    async fn test_unmapped_model_passes_through() {
        let mut meta = meta("http://x", "openai/gpt-4o");
        let request = GeneralOpenAiRequest {
            model: "openai/gpt-4o".to_string(),
            thinking: Some(thinking(Some(512))),
            ..GeneralOpenAiRequest::default()
        };
        let body = adaptor().convert_text_request(&mut meta, request).await.unwrap();
        assert_eq!(body["model"], "openai/gpt-4o");
        assert!(body.get("provider").is_none());
        assert!(body.get("reasoning").is_none());
        assert!(!meta.thinking.include);
    }

    #[tokio::test]
    async fn test_buffered_reasoning_is_exposed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "gen-1",
                "model": "anthropic/claude-sonnet-4",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "42", "reasoning": "counted"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })))
            .mount(&server)
            .await;
        let adaptor = adaptor();
        let mut meta = meta(&server.uri(), "claude-sonnet-4-20250514");
        let upstream = adaptor
            .do_request(&mut meta, bytes::Bytes::from_static(b"{}"), &HeaderMap::new())
            .await
            .unwrap();
        let RelayOutput::Complete { response, usage } = adaptor.do_response(upstream, &mut meta).await.unwrap() else {
            panic!("expected complete");
        };
        assert_eq!(usage.total_tokens, 5);
        let body: Value = serde_json::from_slice(
            &axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap(),
        )
        .unwrap();
        assert_eq!(body["choices"][0]["message"]["reasoning_content"], "counted");
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
    }
}
