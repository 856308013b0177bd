mod common;

use api_relay::channel::ChannelKind;
use api_relay::config::{AppConfig, RateLimitRule};
use api_relay::testing::TestHarness;
use api_relay::testing::fixtures::ChannelRow;
use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{chat_body, eventually, post_json, seed_caller, send};

const CLAUDE: &str = "claude-3-7-sonnet-20250219";

fn claude_stream() -> String {
    let events = [
        json!({"type": "message_start", "message": {"id": "msg_1", "model": CLAUDE, "usage": {"input_tokens": 12, "output_tokens": 1}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "first "}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "second "}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "third"}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "text_delta", "text": "Hello"}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "text_delta", "text": " world"}}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 8}}),
        json!({"type": "message_stop"}),
    ];
    events
        .iter()
        .map(|e| format!("event: {}\ndata: {e}\n\n", e["type"].as_str().unwrap_or_default()))
        .collect()
}

#[tokio::test]
async fn test_claude_stream_inlines_reasoning_before_text() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-upstream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(claude_stream(), "text/event-stream"))
        .expect(1)
        .mount(&upstream)
        .await;

    let harness = TestHarness::new().await;
    harness
        .seed_channel(ChannelRow::new(ChannelKind::Anthropic, &upstream.uri(), &[CLAUDE]))
        .await;
    let (user_id, _) = seed_caller(&harness, "thinker").await;

    let body = json!({
        "model": CLAUDE,
        "stream": true,
        "messages": [{"role": "user", "content": "think first"}],
        "thinking": {"type": "enabled", "thinking_budget": 2048, "include_thinking": true}
    });
    let reply = send(&harness, post_json("/v1/chat/completions", "thinker", &body)).await;
    assert_eq!(reply.status, StatusCode::OK);

    let payloads: Vec<&str> = reply
        .text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(payloads.iter().filter(|p| **p == "[DONE]").count(), 1);
    assert_eq!(payloads.last(), Some(&"[DONE]"));

    let content: String = payloads
        .iter()
        .filter(|p| **p != "[DONE]")
        .filter_map(|p| serde_json::from_str::<Value>(p).ok())
        .filter_map(|frame| frame["choices"][0]["delta"]["content"].as_str().map(str::to_string))
        .collect();
    assert_eq!(content, "<think>first second third</think>Hello world");

    let ctx = &harness.context;
    assert!(
        eventually(|| async { ctx.repo.logs_by_user(user_id).await.unwrap().len() == 1 }).await
    );
    let log = &ctx.repo.logs_by_user(user_id).await.unwrap()[0];
    assert_eq!(log.prompt_tokens, 12);
    assert_eq!(log.completion_tokens, 9);
}

#[tokio::test]
async fn test_relay_rate_limit_rejects_with_headers() {
    let mut config = AppConfig::default();
    config.rate_limit.relay = RateLimitRule::new(2, 60);
    let harness =
        TestHarness::with_config(config, Arc::new(api_relay::billing::LogNotifier::new())).await;
    harness
        .seed_channel(ChannelRow::new(ChannelKind::OpenAi, "http://127.0.0.1:9", &["gpt-4o"]))
        .await;
    seed_caller(&harness, "busy").await;

    // 不存在渠道的模型同样计入限流
    for _ in 0..2 {
        let reply = send(&harness, post_json("/v1/chat/completions", "busy", &chat_body("o1-mini"))).await;
        assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    }
    let limited = send(&harness, post_json("/v1/chat/completions", "busy", &chat_body("o1-mini"))).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers["x-ratelimit-remaining-requests"], "0");
    assert_eq!(limited.headers["x-ratelimit-limit-requests"], "2");
    let message = limited.json()["error"]["message"].as_str().unwrap().to_string();
    assert!(message.starts_with("Rate limit reached for o1-mini"));

    // 不同模型各自计数
    let other = send(&harness, post_json("/v1/chat/completions", "busy", &chat_body("gpt-4o-mini"))).await;
    assert_eq!(other.status, StatusCode::SERVICE_UNAVAILABLE);
}
