//! # 通用中间件
//!
//! 请求 ID、请求体缓存、panic 恢复

use std::panic::AssertUnwindSafe;

use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use serde_json::json;

use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::relay::body::CachedBody;
use crate::{ldebug, lerror};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// 当前请求的 ID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    /// 14 位时间戳前缀 + 18 位 UUID 十六进制，共 32 位
    #[must_use]
    pub fn generate() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{stamp}{}", &random[..18]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 生成请求 ID，写入扩展和响应头
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::generate();
    request.extensions_mut().insert(request_id.clone());
    ldebug!(
        request_id.as_str(),
        LogStage::RequestStart,
        LogComponent::ServerSetup,
        "request_received",
        "收到请求",
        method = %request.method(),
        path = %request.uri().path()
    );
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn request_id_of(request: &Request) -> String {
    request
        .extensions()
        .get::<RequestId>()
        .map(|rid| rid.0.clone())
        .unwrap_or_default()
}

/// 一次性读取请求体放入 [`CachedBody`]，再还原为新的请求体
pub async fn cache_body(request: Request, next: Next) -> Response {
    let request_id = request_id_of(&request);
    let (mut parts, body) = request.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return RelayError::wrap(
                format!("读取请求体失败: {e}"),
                "read_request_body_failed",
                StatusCode::BAD_REQUEST,
            )
            .with_request_id(&request_id)
            .into_response();
        }
    };
    parts.extensions.insert(CachedBody(bytes.clone()));
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// 处理器 panic 时返回 500，并记录请求体
pub async fn recover(request: Request, next: Next) -> Response {
    let request_id = request_id_of(&request);
    let body = request.extensions().get::<CachedBody>().cloned();
    let path = request.uri().path().to_string();
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let body = body
                .map(|b| String::from_utf8_lossy(&b.0).into_owned())
                .unwrap_or_default();
            lerror!(
                &request_id,
                LogStage::Error,
                LogComponent::ServerSetup,
                "handler_panic",
                "处理器 panic",
                panic = %message,
                path = %path,
                body = %body
            );
            let body = json!({
                "error": {
                    "message": format!("Panic detected, error: {message}"),
                    "type": "api_panic",
                }
            });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::{get, post};
    use tower::ServiceExt;

    #[test]
    fn test_request_id_shape() {
        let id = RequestId::generate();
        assert_eq!(id.0.len(), 32);
        assert!(id.0.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, RequestId::generate());
    }

    #[test]
    fn test_panic_message_variants() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_cached_body_survives_handler_read() {
        async fn echo(axum::Extension(cached): axum::Extension<CachedBody>, body: String) -> String {
            format!("{}|{body}", String::from_utf8_lossy(&cached.0))
        }
        let app = Router::new()
            .route("/echo", post(echo))
            .layer(axum::middleware::from_fn(cache_body));
        let response = app
            .oneshot(
                Request::post("/echo")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"payload|payload");
    }

    #[tokio::test]
    async fn test_panic_becomes_500_with_request_id_header() {
        async fn explode() -> &'static str {
            panic!("handler exploded")
        }
        let app = Router::new()
            .route("/boom", get(explode))
            .layer(axum::middleware::from_fn(recover))
            .layer(axum::middleware::from_fn(request_id));
        let response = app
            .oneshot(Request::get("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["type"], "api_panic");
        assert_eq!(value["error"]["message"], "Panic detected, error: handler exploded");
    }
}
