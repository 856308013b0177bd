//! # 重试调度
//!
//! 首次尝试失败后按重试次数换渠道再试；每次失败都异步交给监控处理

use std::sync::Arc;

use axum::Extension;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};

use super::body::CachedBody;
use super::controller::{self, AttemptFailure, RelayRequest};
use super::distributor::distribute;
use super::response::render_error;
use crate::app::AppContext;
use crate::auth::AuthContext;
use crate::channel::Channel;
use crate::logging::{LogComponent, LogStage};
use crate::monitor::{ChannelFailure, should_retry};
use crate::server::RequestId;
use crate::{ldebug, lerror, lwarn};

/// 中继入口
pub async fn relay(
    State(ctx): State<AppContext>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Extension(body): Extension<CachedBody>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);
    let request = RelayRequest {
        request_id: request_id.0,
        auth,
        method,
        path_and_query,
        headers,
        body: body.0,
    };
    match distribute(&ctx, &request.auth, &request.request_id).await {
        Ok(channel) => dispatch(&ctx, &request, channel).await,
        Err(err) => err.with_request_id(&request.request_id).into_response(),
    }
}

/// 从选定渠道开始尝试，必要时换渠道重试
pub async fn dispatch(ctx: &AppContext, request: &RelayRequest, first: Arc<Channel>) -> Response {
    let rid = request.request_id.as_str();
    let mut channel = first;
    let mut failure = match controller::relay_once(ctx, request, &channel).await {
        Ok(response) => {
            ctx.monitor.emit(channel.id, true);
            return response;
        }
        Err(failure) => failure,
    };
    report_failure(ctx, request, &channel, &failure);

    let pinned = request.auth.specific_channel_id.is_some();
    let mut retry_times = ctx.options.snapshot().retry_times;
    if !should_retry(pinned, failure.error.status_code) {
        lerror!(
            rid,
            LogStage::ResponseFailure,
            LogComponent::Relay,
            "no_retry",
            "中继失败，此状态码不重试",
            status = failure.error.status_code.as_u16()
        );
        retry_times = 0;
    }

    let (group, model) = (request.auth.group.as_str(), request.auth.request_model.as_str());
    let mut last_failed = channel.id;
    for remaining in (1..=retry_times).rev() {
        let Some(next) = ctx.channels.select(group, model, remaining != retry_times) else {
            lwarn!(rid, LogStage::Scheduling, LogComponent::Selector, "retry_no_channel", "重试时没有可用渠道", group = group, model = model);
            break;
        };
        if next.id == last_failed {
            continue;
        }
        channel = next;
        ldebug!(
            rid,
            LogStage::Scheduling,
            LogComponent::Relay,
            "retry_attempt",
            "换渠道重试",
            channel_id = channel.id,
            remaining = remaining
        );
        match controller::relay_once(ctx, request, &channel).await {
            Ok(response) => {
                ctx.monitor.emit(channel.id, true);
                return response;
            }
            Err(next_failure) => {
                last_failed = channel.id;
                report_failure(ctx, request, &channel, &next_failure);
                failure = next_failure;
            }
        }
    }

    let base_url = if channel.base_url.is_empty() {
        channel.kind.default_base_url()
    } else {
        channel.base_url.as_str()
    };
    render_error(failure.error, base_url, rid).into_response()
}

/// 失败快照交给监控，不等待结果
fn report_failure(ctx: &AppContext, request: &RelayRequest, channel: &Channel, failure: &AttemptFailure) {
    let snapshot = ChannelFailure {
        request_id: request.request_id.clone(),
        channel_id: channel.id,
        channel_name: channel.name.clone(),
        channel_kind: channel.kind,
        group: request.auth.group.clone(),
        model: request.auth.request_model.clone(),
        user_id: request.auth.user_id,
        token_name: request.auth.token_name.clone(),
        error: failure.error.clone(),
        hints: failure.hints.clone(),
    };
    let monitor = ctx.monitor.clone();
    tokio::spawn(async move {
        monitor.process_failure(snapshot).await;
    });
}
