//! # 上游适配器
//!
//! 每种渠道一个适配器，负责把规范请求转换为上游格式、发送请求并把上游响应
//! 翻译回 OpenAI 形状。适配器不做重试，重试由调度循环负责。

mod anthropic;
mod gemini;
mod openai;
mod openrouter;

pub use anthropic::AnthropicAdaptor;
pub use gemini::GeminiAdaptor;
pub use openai::OpenAiAdaptor;
pub use openrouter::OpenRouterAdaptor;

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;

use super::client::{HttpClients, MediaFetcher};
use super::meta::RelayMeta;
use super::model::{GeneralOpenAiRequest, ImageRequest, Usage, VideoRequest};
use super::response;
use super::sse::{SseWriter, StreamSummary, sse_response};
use crate::channel::ChannelKind;
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::repository::Repository;
use crate::{ldebug, lwarn};

/// 适配器处理完成后的产出
#[derive(Debug)]
pub enum RelayOutput {
    /// 已完整读取并翻译的响应
    Complete { response: Response, usage: Usage },
    /// 流式响应；后台任务写完后通过 `summary` 交付用量
    Streaming {
        response: Response,
        summary: oneshot::Receiver<StreamSummary>,
    },
}

impl RelayOutput {
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }
}

/// 启动流式翻译任务；`run` 返回时其用量汇总交给计费
pub fn spawn_stream<F, Fut>(request_id: String, run: F) -> RelayOutput
where
    F: FnOnce(SseWriter) -> Fut,
    Fut: Future<Output = StreamSummary> + Send + 'static,
{
    let (writer, response) = sse_response(request_id);
    let (tx, summary) = oneshot::channel();
    let task = run(writer);
    tokio::spawn(async move {
        let result = task.await;
        let _ = tx.send(result);
    });
    RelayOutput::Streaming { response, summary }
}

/// 适配器共享的依赖
#[derive(Debug, Clone)]
pub struct AdaptorDeps {
    pub clients: Arc<HttpClients>,
    pub media: MediaFetcher,
    pub repo: Repository,
}

/// 上游适配器
#[async_trait]
pub trait Adaptor: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// 发送请求使用的客户端
    fn client(&self) -> &reqwest::Client;

    /// 每次尝试前的准备
    fn init(&self, _meta: &mut RelayMeta) {}

    fn request_url(&self, meta: &RelayMeta) -> Result<String, RelayError>;

    fn setup_headers(
        &self,
        headers: &mut HeaderMap,
        meta: &RelayMeta,
        inbound: &HeaderMap,
    ) -> Result<(), RelayError>;

    /// 文本类请求（对话、补全、向量、审核）转换为上游请求体
    async fn convert_text_request(
        &self,
        meta: &mut RelayMeta,
        request: GeneralOpenAiRequest,
    ) -> Result<Value, RelayError>;

    async fn convert_image_request(
        &self,
        _meta: &mut RelayMeta,
        _request: ImageRequest,
    ) -> Result<Value, RelayError> {
        Err(response::not_implemented())
    }

    async fn convert_video_request(
        &self,
        _meta: &mut RelayMeta,
        _request: VideoRequest,
    ) -> Result<Value, RelayError> {
        Err(response::not_implemented())
    }

    /// 发送一次请求，不重试
    async fn do_request(
        &self,
        meta: &mut RelayMeta,
        body: Bytes,
        inbound: &HeaderMap,
    ) -> Result<reqwest::Response, RelayError> {
        do_request_helper(self, meta, body, inbound).await
    }

    /// 把上游错误响应转换为中继错误；可在 `meta.hints` 中留下失败处理需要的信息
    async fn error_response(
        &self,
        response: reqwest::Response,
        _meta: &mut RelayMeta,
    ) -> RelayError {
        response::upstream_error(response).await
    }

    async fn do_response(
        &self,
        response: reqwest::Response,
        meta: &mut RelayMeta,
    ) -> Result<RelayOutput, RelayError>;

    fn model_list(&self) -> &'static [&'static str];
}

/// 通用请求头：内容类型、`Accept`
fn common_headers(headers: &mut HeaderMap, meta: &RelayMeta, inbound: &HeaderMap) {
    let content_type = inbound
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    headers.insert(header::CONTENT_TYPE, content_type);
    if meta.is_stream {
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
    } else if let Some(accept) = inbound.get(header::ACCEPT) {
        headers.insert(header::ACCEPT, accept.clone());
    }
}

/// 默认的发送实现：URL、请求头、POST
pub async fn do_request_helper<A: Adaptor + ?Sized>(
    adaptor: &A,
    meta: &RelayMeta,
    body: Bytes,
    inbound: &HeaderMap,
) -> Result<reqwest::Response, RelayError> {
    let url = adaptor.request_url(meta)?;
    let mut headers = HeaderMap::new();
    common_headers(&mut headers, meta, inbound);
    adaptor.setup_headers(&mut headers, meta, inbound)?;
    ldebug!(
        &meta.request_id,
        LogStage::UpstreamRequest,
        LogComponent::Adaptor,
        "upstream_request",
        "发送上游请求",
        adaptor = adaptor.name(),
        channel_id = meta.channel_id,
        model = %meta.actual_model,
        stream = meta.is_stream
    );
    adaptor
        .client()
        .post(url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            lwarn!(
                &meta.request_id,
                LogStage::UpstreamRequest,
                LogComponent::Adaptor,
                "upstream_request_failed",
                "上游请求失败",
                channel_id = meta.channel_id,
                error = %e
            );
            RelayError::wrap(e, "do_request_failed", StatusCode::INTERNAL_SERVER_ERROR)
        })
}

/// 把请求头值解析为 [`HeaderValue`]
pub(crate) fn header_value(value: &str) -> Result<HeaderValue, RelayError> {
    HeaderValue::from_str(value)
        .map_err(|e| RelayError::wrap(e, "invalid_header_value", StatusCode::INTERNAL_SERVER_ERROR))
}

/// 按渠道类型解析适配器；未知类型走 OpenAI 兼容实现
#[derive(Debug, Clone)]
pub struct AdaptorRegistry {
    adaptors: HashMap<ChannelKind, Arc<dyn Adaptor>>,
    fallback: Arc<dyn Adaptor>,
}

impl AdaptorRegistry {
    #[must_use]
    pub fn new(deps: &AdaptorDeps) -> Self {
        let openai: Arc<dyn Adaptor> = Arc::new(OpenAiAdaptor::new(deps.clients.clone()));
        let mut adaptors: HashMap<ChannelKind, Arc<dyn Adaptor>> = HashMap::new();
        adaptors.insert(ChannelKind::OpenAi, openai.clone());
        adaptors.insert(ChannelKind::Custom, openai.clone());
        adaptors.insert(
            ChannelKind::Anthropic,
            Arc::new(AnthropicAdaptor::new(deps.clients.clone(), deps.media.clone())),
        );
        adaptors.insert(
            ChannelKind::OpenRouter,
            Arc::new(OpenRouterAdaptor::new(deps.clients.clone())),
        );
        adaptors.insert(ChannelKind::Gemini, Arc::new(GeminiAdaptor::new(deps.clone())));
        Self {
            adaptors,
            fallback: openai,
        }
    }

    #[must_use]
    pub fn resolve(&self, kind: ChannelKind) -> Arc<dyn Adaptor> {
        self.adaptors
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// 替换某一类型的适配器
    pub fn register(&mut self, kind: ChannelKind, adaptor: Arc<dyn Adaptor>) {
        self.adaptors.insert(kind, adaptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KvStore;
    use crate::config::RelayConfig;
    use sea_orm::{Database, DatabaseConnection};

    async fn deps() -> AdaptorDeps {
        let clients = Arc::new(HttpClients::from_config(&RelayConfig::default()).unwrap());
        let db: DatabaseConnection = Database::connect("sqlite::memory:").await.unwrap();
        AdaptorDeps {
            media: MediaFetcher::new(clients.clone(), Arc::new(KvStore::memory())),
            clients,
            repo: Repository::new(Arc::new(db)),
        }
    }

    #[tokio::test]
    async fn test_registry_resolves_and_falls_back() {
        let registry = AdaptorRegistry::new(&deps().await);
        assert_eq!(registry.resolve(ChannelKind::Anthropic).name(), "anthropic");
        assert_eq!(registry.resolve(ChannelKind::Gemini).name(), "gemini");
        assert_eq!(registry.resolve(ChannelKind::OpenRouter).name(), "openrouter");
        assert_eq!(registry.resolve(ChannelKind::Custom).name(), "openai");
        assert_eq!(registry.resolve(ChannelKind::Other(42)).name(), "openai");
    }

    #[tokio::test]
    async fn test_spawned_stream_delivers_summary() {
        let output = spawn_stream("rid".to_string(), |mut writer| async move {
            writer.send_raw("{}").await;
            writer.done().await;
            writer.summary(Usage::new(1, 2))
        });
        let RelayOutput::Streaming { response, summary } = output else {
            panic!("expected streaming output");
        };
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"data: {}\n\ndata: [DONE]\n\n");
        assert_eq!(summary.await.unwrap().usage.total_tokens, 3);
    }
}
