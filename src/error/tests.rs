//! # 错误处理测试

use super::{Context, ErrorCategory, ProxyError, RelayError};
use axum::http::StatusCode;
use serde_json::json;
use std::error::Error;

#[test]
fn test_config_error_creation() {
    let err = ProxyError::config("端口不能为 0");
    assert!(matches!(err, ProxyError::Config { .. }));
    assert_eq!(err.to_string(), "配置错误: 端口不能为 0");
    assert_eq!(err.category(), ErrorCategory::Server);
}

#[test]
fn test_error_macro_with_source() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err = crate::error!(Database, "打开数据库失败", io_err);
    assert!(matches!(err, ProxyError::Database { .. }));
    assert!(err.source().is_some());
}

#[test]
fn test_context_wraps_inner_error() {
    let result: std::result::Result<(), ProxyError> = Err(ProxyError::quota("user quota is not enough"));
    let err = result.context("预扣费失败").unwrap_err();
    assert!(matches!(err, ProxyError::Context { .. }));
    assert_eq!(err.to_http_response_parts().0, StatusCode::FORBIDDEN);
    assert_eq!(err.message(), "预扣费失败: user quota is not enough");
}

#[test]
fn test_auto_conversion_from_toml_error() {
    let toml_err = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
    let err: ProxyError = toml_err.into();
    assert!(err.to_string().contains("TOML解析失败"));
}

#[test]
fn test_relay_error_request_id_suffix_once() {
    let err = RelayError::abort(StatusCode::UNAUTHORIZED, "invalid token")
        .with_request_id("abc")
        .with_request_id("abc");
    assert_eq!(err.error.message, "invalid token (request id: abc)");
    assert_eq!(err.body()["error"]["type"], "api_error");
}

#[test]
fn test_relay_error_from_openai_body() {
    let body = json!({"error": {"message": "Incorrect API key", "type": "invalid_request_error", "code": "invalid_api_key"}});
    let err = RelayError::from_upstream(StatusCode::UNAUTHORIZED, body.to_string().as_bytes());
    assert_eq!(err.error.message, "Incorrect API key");
    assert_eq!(err.code_str(), "invalid_api_key");
}

#[test]
fn test_relay_error_from_gemini_body_uses_status_as_type() {
    let body = json!({"error": {"code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED"}});
    let err = RelayError::from_upstream(StatusCode::TOO_MANY_REQUESTS, body.to_string().as_bytes());
    assert_eq!(err.error.kind, "RESOURCE_EXHAUSTED");
}

#[test]
fn test_relay_error_from_plain_text_body() {
    let err = RelayError::from_upstream(StatusCode::BAD_GATEWAY, b"upstream connect error");
    assert!(err.error.message.starts_with("bad response status code 502"));
    assert_eq!(err.code_str(), "bad_response_status_code");
}
