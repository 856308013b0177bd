#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use api_relay::server::build_router;
use api_relay::testing::TestHarness;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::Value;
use tower::ServiceExt;

/// 响应状态、头与 JSON 体（非 JSON 时为字符串）
pub struct Reply {
    pub status: StatusCode,
    pub headers: axum::http::HeaderMap,
    pub text: String,
}

impl Reply {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.text).unwrap_or(Value::String(self.text.clone()))
    }
}

pub async fn send(harness: &TestHarness, request: Request<Body>) -> Reply {
    let response = build_router(harness.context.clone())
        .oneshot(request)
        .await
        .expect("router responds");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    Reply {
        status,
        headers,
        text: String::from_utf8_lossy(&bytes).into_owned(),
    }
}

pub fn post_json(path: &str, key: &str, body: &Value) -> Request<Body> {
    Request::post(path)
        .header(header::AUTHORIZATION, format!("Bearer sk-{key}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

pub fn get(path: &str, key: &str) -> Request<Body> {
    Request::get(path)
        .header(header::AUTHORIZATION, format!("Bearer sk-{key}"))
        .body(Body::empty())
        .expect("build request")
}

/// 轮询直到条件成立；后台结算与监控在独立任务中完成
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn chat_body(model: &str) -> Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}]
    })
}

pub fn openai_completion(model: &str, content: &str) -> Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
    })
}

/// 普通用户与令牌，返回令牌 key（不含 `sk-` 前缀）
pub async fn seed_caller(harness: &TestHarness, key: &str) -> (i32, i32) {
    let user = harness.seed_user(key, "default", 10_000_000).await;
    let token = harness.seed_token(user.id, key, 10_000_000).await;
    (user.id, token.id)
}
