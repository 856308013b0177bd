mod common;

use api_relay::auth::TokenStatus;
use api_relay::testing::TestHarness;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use pretty_assertions::assert_eq;

use common::{chat_body, get, post_json, seed_caller, send};

#[tokio::test]
async fn test_invalid_key_rejection_is_served_from_cache() {
    let harness = TestHarness::new().await;
    let user = harness.seed_user("mallory", "default", 1_000).await;

    let first = send(&harness, post_json("/v1/chat/completions", "bad", &chat_body("gpt-4o"))).await;
    assert_eq!(first.status, StatusCode::UNAUTHORIZED);

    // 令牌随后写入数据库，负缓存期内仍返回原结果
    harness.seed_token(user.id, "bad", 1_000).await;
    let second = send(&harness, post_json("/v1/chat/completions", "bad", &chat_body("gpt-4o"))).await;
    assert_eq!(second.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        second.json()["error"]["message"],
        first.json()["error"]["message"]
    );
}

#[tokio::test]
async fn test_missing_authorization_is_401() {
    let harness = TestHarness::new().await;
    let request = Request::post("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(chat_body("gpt-4o").to_string()))
        .unwrap();
    let reply = send(&harness, request).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let harness = TestHarness::new().await;
    let (_, token_id) = seed_caller(&harness, "stale").await;
    harness.expire_token(token_id).await;

    let reply = send(&harness, post_json("/v1/chat/completions", "stale", &chat_body("gpt-4o"))).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    let row = harness.context.repo.token_by_id(token_id).await.unwrap().unwrap();
    assert_eq!(row.status, TokenStatus::Expired.code());
}

#[tokio::test]
async fn test_pinned_channel_requires_admin() {
    let harness = TestHarness::new().await;
    seed_caller(&harness, "plain").await;

    let reply = send(
        &harness,
        post_json("/v1/chat/completions", "plain-7", &chat_body("gpt-4o")),
    )
    .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_subscription_reports_token_limits() {
    let harness = TestHarness::new().await;
    seed_caller(&harness, "ledger").await;

    let reply = send(&harness, get("/v1/dashboard/billing/subscription", "ledger")).await;
    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["object"], "billing_subscription");

    let alias = send(&harness, get("/dashboard/billing/usage", "ledger")).await;
    assert_eq!(alias.status, StatusCode::OK);
    assert_eq!(alias.json()["object"], "list");
}

#[tokio::test]
async fn test_status_and_unknown_routes() {
    let harness = TestHarness::new().await;
    let reply = send(
        &harness,
        Request::get("/api/status").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["kv"], "memory");
    assert!(reply.headers.contains_key("x-request-id"));

    let missing = send(
        &harness,
        Request::get("/v1/nothing-here").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    let message = missing.json()["error"]["message"].as_str().unwrap().to_string();
    assert!(message.starts_with("Invalid URL (GET /v1/nothing-here)"));
}
