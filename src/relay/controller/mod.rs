//! # 中继控制器
//!
//! 单次尝试：按模式解析请求、预扣、经适配器往返上游、后台结算。
//! 失败时把错误和适配器留下的提示一并交回调度循环。

mod audio;
pub mod billing;
mod image;
mod proxy;
mod text;
mod video;

pub use billing::{subscription, usage, usage_detail};

use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use super::adaptor::{Adaptor, RelayOutput};
use super::meta::{AdaptorHints, RelayMeta};
use super::mode::RelayMode;
use super::model::Usage;
use super::response::{is_error_response, not_found, not_implemented};
use crate::app::AppContext;
use crate::auth::AuthContext;
use crate::billing::{PreConsumed, QuotaAccountant, UsageCharge};
use crate::channel::Channel;
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror};

/// 一次中继请求；请求体已缓存，重试时原样复用
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub request_id: String,
    pub auth: AuthContext,
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RelayRequest {
    #[must_use]
    pub fn path(&self) -> &str {
        self.path_and_query
            .split('?')
            .next()
            .unwrap_or_default()
    }

    fn meta(&self, channel: &Channel) -> RelayMeta {
        RelayMeta::new(&self.auth, channel, &self.request_id, &self.path_and_query)
    }
}

/// 一次失败的尝试
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub error: RelayError,
    pub hints: AdaptorHints,
}

impl AttemptFailure {
    fn with_hints(error: RelayError, meta: &RelayMeta) -> Self {
        Self {
            error,
            hints: meta.hints.clone(),
        }
    }
}

impl From<RelayError> for AttemptFailure {
    fn from(error: RelayError) -> Self {
        Self {
            error,
            hints: AdaptorHints::default(),
        }
    }
}

/// 使用选定渠道尝试一次
pub async fn relay_once(
    ctx: &AppContext,
    request: &RelayRequest,
    channel: &Channel,
) -> Result<Response, AttemptFailure> {
    let mode = RelayMode::from_path(request.path());
    ldebug!(
        &request.request_id,
        LogStage::UpstreamRequest,
        LogComponent::Relay,
        "relay_attempt",
        "开始中继尝试",
        mode = %mode,
        channel_id = channel.id,
        channel_kind = %channel.kind
    );
    match mode {
        mode if mode.is_text() => text::relay_text(ctx, request, channel).await,
        RelayMode::ImagesGenerations => image::relay_image(ctx, request, channel).await,
        RelayMode::ImagesEdits => {
            if image_edit_allowed(ctx, channel) {
                image::relay_image(ctx, request, channel).await
            } else {
                Ok(not_implemented()
                    .with_request_id(&request.request_id)
                    .into_response())
            }
        }
        mode if mode.is_audio() => audio::relay_audio(ctx, request, channel).await,
        RelayMode::VideoGenerations => video::relay_video(ctx, request, channel).await,
        RelayMode::Proxy => proxy::relay_proxy(ctx, request, channel).await,
        _ => Ok(not_found(request.method.as_str(), request.path())
            .with_request_id(&request.request_id)
            .into_response()),
    }
}

fn image_edit_allowed(ctx: &AppContext, channel: &Channel) -> bool {
    let kind = channel.kind.name();
    ctx.options
        .snapshot()
        .image_edit_channel_kinds
        .iter()
        .any(|k| k.eq_ignore_ascii_case(kind))
}

/// 发送并读取上游响应；错误响应交给适配器翻译
pub(crate) async fn round_trip(
    adaptor: &dyn Adaptor,
    meta: &mut RelayMeta,
    body: Bytes,
    inbound: &HeaderMap,
) -> Result<RelayOutput, RelayError> {
    let response = adaptor.do_request(meta, body, inbound).await?;
    if is_error_response(meta, &response) {
        return Err(adaptor.error_response(response, meta).await);
    }
    adaptor.do_response(response, meta).await
}

/// 规范请求序列化为上游请求体
pub(crate) fn encode_body(value: &serde_json::Value) -> Result<Bytes, RelayError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| RelayError::wrap(e, "marshal_request_body_failed", StatusCode::INTERNAL_SERVER_ERROR))
}

/// 由用量计算最终额度
pub(crate) type QuotaFn = Box<dyn FnOnce(&Usage) -> Charged + Send>;

/// 结算使用的额度与记入日志的 token 数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Charged {
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

/// 响应交付后的结算参数
pub(crate) struct Settlement {
    pub pre: Option<PreConsumed>,
    pub model_name: String,
    pub content: String,
    pub quota: QuotaFn,
}

/// 交付响应；结算在后台任务中完成，不随客户端断开而取消
pub(crate) fn finish(
    ctx: &AppContext,
    meta: &RelayMeta,
    output: RelayOutput,
    settlement: Settlement,
) -> Response {
    let pre_consumed = settlement.pre.map_or(0, PreConsumed::settle);
    let base = UsageCharge {
        request_id: meta.request_id.clone(),
        user_id: meta.user_id,
        token_id: meta.token_id,
        token_name: meta.token_name.clone(),
        channel_id: meta.channel_id,
        model_name: settlement.model_name,
        pre_consumed,
        content: settlement.content,
        is_stream: meta.is_stream,
        ..UsageCharge::default()
    };
    let accountant = ctx.accountant.clone();
    let quota = settlement.quota;
    let start = meta.start_time;

    match output {
        RelayOutput::Complete { response, usage } => {
            let elapsed = meta.elapsed_ms();
            tokio::spawn(settle(accountant, base, quota(&usage), usage, elapsed, elapsed));
            response
        }
        RelayOutput::Streaming { response, summary } => {
            tokio::spawn(async move {
                let summary = summary.await.unwrap_or_default();
                let elapsed = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
                let first = summary.first_frame_at.map_or(elapsed, |at| {
                    i64::try_from(at.duration_since(start).as_millis()).unwrap_or(i64::MAX)
                });
                let charged = quota(&summary.usage);
                settle(accountant, base, charged, summary.usage, elapsed, first).await;
            });
            response
        }
    }
}

async fn settle(
    accountant: QuotaAccountant,
    mut charge: UsageCharge,
    charged: Charged,
    usage: Usage,
    elapsed_ms: i64,
    first_response_ms: i64,
) {
    charge.quota = charged.quota;
    charge.prompt_tokens = charged.prompt_tokens;
    charge.completion_tokens = charged.completion_tokens;
    charge.elapsed_ms = elapsed_ms;
    charge.first_response_ms = first_response_ms;
    let request_id = charge.request_id.clone();
    ldebug!(
        &request_id,
        LogStage::Billing,
        LogComponent::Billing,
        "settle",
        "结算额度",
        quota = charge.quota,
        pre_consumed = charge.pre_consumed,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens
    );
    if let Err(e) = accountant.settle(charge).await {
        lerror!(&request_id, LogStage::Billing, LogComponent::Billing, "settle_failed", "结算失败", error = %e);
    }
}
