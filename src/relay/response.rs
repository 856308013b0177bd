//! # 响应辅助
//!
//! 上游错误识别、错误体改写与透传响应的构造

use std::sync::LazyLock;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use regex::Regex;
use serde::Serialize;

use super::meta::RelayMeta;
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

/// 上游返回了错误：状态码不是 200/201，或流式请求却拿到了 JSON
#[must_use]
pub fn is_error_response(meta: &RelayMeta, response: &reqwest::Response) -> bool {
    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::CREATED {
        return true;
    }
    if meta.is_stream {
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        return content_type.starts_with("application/json");
    }
    false
}

/// 读取上游错误响应并转换为中继错误
pub async fn upstream_error(response: reqwest::Response) -> RelayError {
    let status = response.status();
    match response.bytes().await {
        Ok(body) => RelayError::from_upstream(status, &body),
        Err(e) => RelayError::wrap(e, "read_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// 501 `api_not_implemented`
#[must_use]
pub fn not_implemented() -> RelayError {
    RelayError::new(
        StatusCode::NOT_IMPLEMENTED,
        "API not implemented",
        "api_error",
        "api_not_implemented",
    )
}

/// 404 未知路由
#[must_use]
pub fn not_found(method: &str, path: &str) -> RelayError {
    RelayError::new(
        StatusCode::NOT_FOUND,
        format!("Invalid URL ({method} {path})"),
        "invalid_request_error",
        "",
    )
}

static URL_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"https?://[^\s'\x22]+").ok());

/// 返回给客户端前隐藏渠道地址，并附加请求 ID
#[must_use]
pub fn render_error(mut err: RelayError, base_url: &str, request_id: &str) -> RelayError {
    let host = url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    let leaks = (!base_url.is_empty() && err.error.message.contains(base_url))
        || (!host.is_empty() && err.error.message.contains(&host));
    if leaks {
        lwarn!(
            request_id,
            LogStage::ResponseFailure,
            LogComponent::Relay,
            "hide_upstream_url",
            "错误信息包含渠道地址，已替换",
            original = %err.error.message
        );
        let replaced = URL_PATTERN.as_ref().map_or_else(
            || err.error.message.replace(base_url, "our site"),
            |re| re.replace_all(&err.error.message, "our site").into_owned(),
        );
        err.error.message = if host.is_empty() {
            replaced
        } else {
            replaced.replace(&format!("\"{host}\""), "\"our site\"").replace(&host, "our site")
        };
    }
    err.with_request_id(request_id)
}

/// 序列化为 JSON 响应
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response, RelayError> {
    let body = serde_json::to_vec(value).map_err(|e| {
        RelayError::wrap(e, "marshal_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
    })?;
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

/// 原样透传上游响应（状态码、内容类型与响应体）
#[must_use]
pub fn passthrough(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    for name in [header::CONTENT_TYPE, header::CONTENT_DISPOSITION] {
        if let Some(value) = headers.get(&name) {
            response.headers_mut().insert(name, value.clone());
        }
    }
    response
}

/// 读取完整上游响应体
pub async fn read_body(response: reqwest::Response) -> Result<(StatusCode, HeaderMap, Bytes), RelayError> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| {
        RelayError::wrap(e, "read_response_body_failed", StatusCode::INTERNAL_SERVER_ERROR)
    })?;
    Ok((status, headers, body))
}

/// 当前 Unix 秒
#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `chatcmpl-<uuid>`
#[must_use]
pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_not_implemented_body() {
        let body = not_implemented().body();
        assert_eq!(body["error"]["code"], "api_not_implemented");
        assert_eq!(body["error"]["type"], "api_error");
        assert_eq!(not_implemented().status_code, StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn test_render_hides_channel_url() {
        let err = RelayError::new(
            StatusCode::BAD_GATEWAY,
            "Post \"https://api.secret.example/v1/chat\": dial tcp timeout",
            "upstream_error",
            "",
        );
        let rendered = render_error(err, "https://api.secret.example", "abc");
        assert!(!rendered.error.message.contains("secret"));
        assert!(rendered.error.message.contains("our site"));
        assert!(rendered.error.message.ends_with("(request id: abc)"));
    }

    #[test]
    fn test_render_keeps_unrelated_message() {
        let err = RelayError::abort(StatusCode::TOO_MANY_REQUESTS, "slow down");
        let rendered = render_error(err, "https://api.openai.com", "rid");
        assert_eq!(rendered.error.message, "slow down (request id: rid)");
    }

    #[test]
    fn test_completion_id_shape() {
        let id = completion_id();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), "chatcmpl-".len() + 32);
    }
}
