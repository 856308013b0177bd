//! # 中继错误
//!
//! OpenAI 形状的错误体：`{"error": {"message", "type", "param", "code"}}`

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::ProxyError;

/// OpenAI 兼容错误对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub param: String,
    #[serde(default)]
    pub code: Value,
}

/// 携带 HTTP 状态码的中继错误
#[derive(Debug, Clone, PartialEq)]
pub struct RelayError {
    pub error: OpenAiError,
    pub status_code: StatusCode,
}

#[derive(Deserialize)]
struct UpstreamErrorEnvelope {
    error: Value,
}

impl RelayError {
    pub fn new(
        status_code: StatusCode,
        message: impl Into<String>,
        kind: impl Into<String>,
        code: impl Into<Value>,
    ) -> Self {
        Self {
            error: OpenAiError {
                message: message.into(),
                kind: kind.into(),
                param: String::new(),
                code: code.into(),
            },
            status_code,
        }
    }

    /// 包装本地错误，类型固定为 `relay_error`
    pub fn wrap(err: impl fmt::Display, code: &str, status_code: StatusCode) -> Self {
        Self::new(status_code, err.to_string(), "relay_error", code)
    }

    /// 网关在鉴权、限流等环节中止请求时使用的错误
    pub fn abort(status_code: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status_code, message, "api_error", Value::Null)
    }

    /// 由上游的非 2xx 响应体构造
    #[must_use]
    pub fn from_upstream(status_code: StatusCode, body: &[u8]) -> Self {
        if let Ok(envelope) = serde_json::from_slice::<UpstreamErrorEnvelope>(body) {
            let value = envelope.error;
            if let Some(message) = value.as_str().filter(|m| !m.is_empty()) {
                return Self::new(status_code, message, "upstream_error", Value::Null);
            }
            if value.is_object() {
                let status = value["status"].as_str().map(str::to_string);
                if let Ok(mut error) = serde_json::from_value::<OpenAiError>(value) {
                    if error.kind.is_empty() {
                        error.kind = status.unwrap_or_else(|| "upstream_error".to_string());
                    }
                    if !error.message.is_empty() {
                        return Self { error, status_code };
                    }
                }
            }
        }

        let text = String::from_utf8_lossy(body);
        let snippet: String = text.chars().take(512).collect();
        let message = if snippet.trim().is_empty() {
            format!("bad response status code {}", status_code.as_u16())
        } else {
            format!(
                "bad response status code {}, body: {}",
                status_code.as_u16(),
                snippet.trim()
            )
        };
        Self::new(status_code, message, "upstream_error", "bad_response_status_code")
    }

    /// 在消息末尾附加请求 ID（已存在则不重复追加）
    #[must_use]
    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.error.message = message_with_request_id(&self.error.message, request_id);
        self
    }

    #[must_use]
    pub fn code_str(&self) -> &str {
        self.error.code.as_str().unwrap_or_default()
    }

    /// 响应体 JSON
    #[must_use]
    pub fn body(&self) -> Value {
        serde_json::json!({ "error": self.error })
    }
}

/// `msg (request id: rid)`
#[must_use]
pub fn message_with_request_id(message: &str, request_id: &str) -> String {
    if request_id.is_empty() || message.contains("(request id:") {
        message.to_string()
    } else {
        format!("{message} (request id: {request_id})")
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status {}: {} ({})",
            self.status_code.as_u16(),
            self.error.message,
            self.error.kind
        )
    }
}

impl std::error::Error for RelayError {}

impl From<ProxyError> for RelayError {
    fn from(err: ProxyError) -> Self {
        let (status, code) = err.to_http_response_parts();
        let code = code.to_string();
        Self::new(status, err.message(), "relay_error", code)
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status_code, Json(self.body())).into_response()
    }
}
