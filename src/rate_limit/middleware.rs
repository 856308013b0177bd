//! # 限流中间件

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::{RateDecision, RateLimitClass, effective_limit};
use crate::app::AppContext;
use crate::auth::key::AuthUtils;
use crate::auth::{AuthContext, client_ip};
use crate::error::{ProxyError, RelayError};
use crate::logging::{LogComponent, LogStage};
use crate::server::RequestId;
use crate::{lerror, lwarn};

const LIMIT_HEADER: &str = "x-ratelimit-limit-requests";
const REMAINING_HEADER: &str = "x-ratelimit-remaining-requests";

fn reject_response(request_id: &str, message: String, limit: i64, remaining: i64) -> Response {
    let mut response = RelayError::abort(StatusCode::TOO_MANY_REQUESTS, message)
        .with_request_id(request_id)
        .into_response();
    let headers = response.headers_mut();
    headers.insert(LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
    response
}

/// 限流存储不可用时拒绝请求
fn backend_failure(request_id: &str, e: &ProxyError) -> Response {
    lerror!(
        request_id,
        LogStage::RateLimit,
        LogComponent::RateLimiter,
        "rate_limit_backend_failed",
        "限流存储访问失败",
        error = %e
    );
    RelayError::abort(StatusCode::INTERNAL_SERVER_ERROR, e.message())
        .with_request_id(request_id)
        .into_response()
}

fn request_id_of(request: &Request) -> String {
    request
        .extensions()
        .get::<RequestId>()
        .map(|rid| rid.0.clone())
        .unwrap_or_default()
}

/// 中继请求限流：有令牌时按 `<apikey>_<model>`，否则按客户端 IP
pub async fn relay_rate_limit(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Response {
    // 内部重试请求不重复计数
    if request.uri().query().is_some_and(|q| q.starts_with("retry=")) {
        return next.run(request).await;
    }

    let request_id = request_id_of(&request);
    let rule = RateLimitClass::Relay.rule(&ctx.config.rate_limit);
    let auth = request.extensions().get::<AuthContext>().cloned();
    let (subject, limit, label) = match &auth {
        Some(auth) if !auth.api_key.is_empty() => (
            format!("{}_{}", auth.api_key, auth.request_model),
            effective_limit(auth.rpm_limit, rule.num),
            Some((auth.request_model.clone(), AuthUtils::mask_key(&auth.api_key))),
        ),
        _ => (client_ip(&request), rule.num, None),
    };

    match ctx
        .rate_limiter
        .check(RateLimitClass::Relay, &subject, limit, rule.duration)
        .await
    {
        Ok(RateDecision::Pass) => next.run(request).await,
        Ok(RateDecision::Reject {
            limit,
            used,
            remaining,
        }) => {
            let message = match label {
                Some((model, masked)) => format!(
                    "Rate limit reached for {model} in api-key {masked} on requests per minute (RPM): Limit {limit}, Used {used}, Requested 1"
                ),
                None => format!(
                    "Rate limit reached for {subject} on requests per minute (RPM): Limit {limit}, Used {used}, Requested 1"
                ),
            };
            lwarn!(
                &request_id,
                LogStage::RateLimit,
                LogComponent::RateLimiter,
                "relay_rate_limited",
                &message,
                remaining = remaining
            );
            reject_response(&request_id, message, limit, remaining)
        }
        Err(e) => backend_failure(&request_id, &e),
    }
}

/// 非中继接口按 IP 的全局限流
pub async fn global_api_rate_limit(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request_id_of(&request);
    let rule = RateLimitClass::GlobalApi.rule(&ctx.config.rate_limit);
    let ip = client_ip(&request);
    match ctx
        .rate_limiter
        .check(RateLimitClass::GlobalApi, &ip, rule.num, rule.duration)
        .await
    {
        Ok(RateDecision::Reject {
            limit, remaining, ..
        }) => reject_response(&request_id, "Too many requests".to_string(), limit, remaining),
        Ok(RateDecision::Pass) => next.run(request).await,
        Err(e) => backend_failure(&request_id, &e),
    }
}
