//! # 原样代理
//!
//! `/v1/proxy/:channelid/*path` 以渠道凭据转发到 `{base}/{path}`，不计费

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;

use super::{AttemptFailure, RelayRequest};
use crate::app::AppContext;
use crate::channel::Channel;
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::relay::response::{passthrough, read_body};
use crate::relay::RelayMeta;
use crate::ldebug;

/// 去掉 `/v1/proxy/<id>` 前缀后的上游路径（含查询串）
pub(super) fn upstream_path(path_and_query: &str) -> Option<String> {
    let rest = path_and_query.strip_prefix("/v1/proxy/")?;
    let (_, tail) = rest.split_once('/').unwrap_or((rest, ""));
    Some(format!("/{tail}"))
}

pub(super) async fn relay_proxy(
    ctx: &AppContext,
    request: &RelayRequest,
    channel: &Channel,
) -> Result<Response, AttemptFailure> {
    if !request.auth.is_admin {
        return Err(RelayError::abort(StatusCode::FORBIDDEN, "仅管理员可使用代理接口").into());
    }
    let path = upstream_path(&request.path_and_query)
        .ok_or_else(|| RelayError::wrap("invalid proxy path", "invalid_proxy_path", StatusCode::BAD_REQUEST))?;
    let meta: RelayMeta = request.meta(channel);
    let adaptor = ctx.adaptors.resolve(meta.channel_kind);

    let mut headers = HeaderMap::new();
    if let Some(content_type) = request.headers.get(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, content_type.clone());
    }
    adaptor.setup_headers(&mut headers, &meta, &request.headers)?;
    let url = format!("{}{path}", meta.base_url);
    ldebug!(&meta.request_id, LogStage::UpstreamRequest, LogComponent::Relay, "proxy_request", "代理请求", method = %request.method, channel_id = meta.channel_id);

    let response = adaptor
        .client()
        .request(request.method.clone(), url)
        .headers(headers)
        .body(request.body.clone())
        .send()
        .await
        .map_err(|e| RelayError::wrap(e, "do_request_failed", StatusCode::INTERNAL_SERVER_ERROR))?;
    let (status, headers, body) = read_body(response).await?;
    if !status.is_success() {
        return Err(RelayError::from_upstream(status, &body).into());
    }
    Ok(passthrough(status, &headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_path() {
        assert_eq!(upstream_path("/v1/proxy/3/v1beta/models?x=1").as_deref(), Some("/v1beta/models?x=1"));
        assert_eq!(upstream_path("/v1/proxy/3").as_deref(), Some("/"));
        assert!(upstream_path("/v1/chat/completions").is_none());
    }
}
