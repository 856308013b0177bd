mod common;

use api_relay::channel::ChannelKind;
use api_relay::testing::TestHarness;
use api_relay::testing::fixtures::ChannelRow;
use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{chat_body, eventually, post_json, seed_caller, send};

const CHAT_MODEL: &str = "gemini-1.5-pro";
const IMAGE_MODEL: &str = "gemini-2.0-flash-exp-image-generation";

fn exhausted() -> ResponseTemplate {
    ResponseTemplate::new(429).set_body_json(json!({
        "error": {
            "code": 429,
            "message": "Resource has been exhausted (e.g. check quota).",
            "status": "RESOURCE_EXHAUSTED",
            "details": [{
                "@type": "type.googleapis.com/google.rpc.RetryInfo",
                "retryDelay": "37s"
            }]
        }
    }))
}

fn answer(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP",
            "index": 0
        }],
        "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
    }))
}

#[tokio::test]
async fn test_exhausted_quota_puts_channel_to_sleep() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .and(header("x-goog-api-key", "sk-upstream"))
        .respond_with(exhausted())
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r":generateContent$"))
        .respond_with(answer("pong"))
        .mount(&upstream)
        .await;

    let harness = TestHarness::new().await;
    let channel = harness
        .seed_channel(ChannelRow::new(ChannelKind::Gemini, &upstream.uri(), &[CHAT_MODEL]))
        .await;
    seed_caller(&harness, "sleepy").await;

    let first = send(&harness, post_json("/v1/chat/completions", "sleepy", &chat_body(CHAT_MODEL))).await;
    assert_eq!(first.status, StatusCode::TOO_MANY_REQUESTS);

    let ctx = &harness.context;
    assert!(eventually(|| async { ctx.channels.is_sleeping(channel.id, CHAT_MODEL) }).await);
    let entry = ctx
        .channels
        .sleeping_entries()
        .into_iter()
        .find(|e| e.channel_id == channel.id)
        .unwrap();
    let now = chrono::Utc::now().timestamp();
    assert!(entry.wake_at > now && entry.wake_at <= now + 37);

    let skipped = send(&harness, post_json("/v1/chat/completions", "sleepy", &chat_body(CHAT_MODEL))).await;
    assert_eq!(skipped.status, StatusCode::SERVICE_UNAVAILABLE);

    assert_eq!(ctx.channels.wake_all(now + 60), 1);
    let woke = send(&harness, post_json("/v1/chat/completions", "sleepy", &chat_body(CHAT_MODEL))).await;
    assert_eq!(woke.status, StatusCode::OK);
    assert_eq!(woke.json()["choices"][0]["message"]["content"], "pong");
}

#[tokio::test]
async fn test_image_edit_is_refused_on_openai_channels() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let harness = TestHarness::new().await;
    harness
        .seed_channel(ChannelRow::new(ChannelKind::OpenAi, &upstream.uri(), &["dall-e-2"]))
        .await;
    seed_caller(&harness, "painter").await;

    let body = json!({"model": "dall-e-2", "prompt": "add a hat", "image": "https://x/cat.png"});
    let reply = send(&harness, post_json("/v1/images/edits", "painter", &body)).await;
    assert_eq!(reply.status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(reply.json()["error"]["code"], "api_not_implemented");
}

#[tokio::test]
async fn test_image_edit_routes_through_gemini() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(format!("models/{IMAGE_MODEL}:generateContent$")))
        .and(body_partial_json(json!({
            "generationConfig": {"responseModalities": ["text", "image"]}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "here you go"},
                    {"inlineData": {"mimeType": "image/png", "data": "aGF0"}}
                ]},
                "finishReason": "STOP",
                "index": 0
            }]
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let harness = TestHarness::new().await;
    harness
        .seed_channel(ChannelRow::new(ChannelKind::Gemini, &upstream.uri(), &[IMAGE_MODEL]))
        .await;
    let (user_id, _) = seed_caller(&harness, "editor").await;

    let body = json!({
        "model": IMAGE_MODEL,
        "prompt": "add a hat",
        "image": "data:image/png;base64,Y2F0"
    });
    let reply = send(&harness, post_json("/v1/images/edits", "editor", &body)).await;
    assert_eq!(reply.status, StatusCode::OK);
    let json = reply.json();
    assert_eq!(json["data"][0]["b64_json"], "aGF0");
    assert_eq!(json["data"][0]["revised_prompt"], "here you go");

    let ctx = &harness.context;
    assert!(
        eventually(|| async { ctx.repo.logs_by_user(user_id).await.unwrap().len() == 1 }).await
    );
}
