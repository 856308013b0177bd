//! # 账单查询
//!
//! OpenAI 风格的 `dashboard/billing` 接口：订阅、用量、近七日明细

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use entity::tokens;
use serde::Serialize;

use crate::app::AppContext;
use crate::auth::{AuthContext, TokenStatus};
use crate::error::RelayError;
use crate::server::RequestId;

/// 无限额度令牌展示的额度
const UNLIMITED_AMOUNT: f64 = 100_000_000.0;
const DETAIL_WINDOW_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionResponse {
    pub object: &'static str,
    pub has_payment_method: bool,
    pub soft_limit_usd: f64,
    pub hard_limit_usd: f64,
    pub system_hard_limit_usd: f64,
    pub used_usd: f64,
    pub balance_usd: f64,
    pub access_until: i64,
    pub status: &'static str,
    pub gpt4: bool,
    pub expire_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageResponse {
    pub object: &'static str,
    /// 单位：0.01 美元
    pub total_usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageDetailCost {
    pub model: String,
    pub quota: f64,
    pub request_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageDetailResponse {
    pub object: &'static str,
    pub daily_costs: Vec<UsageDetailCost>,
}

const fn status_label(status: TokenStatus) -> &'static str {
    match status {
        TokenStatus::Disabled => "banned",
        TokenStatus::Expired => "expired",
        TokenStatus::Exhausted => "exhausted",
        TokenStatus::Enabled | TokenStatus::Unknown => "normal",
    }
}

fn format_time(ts: i64, pattern: &str) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format(pattern).to_string())
        .unwrap_or_default()
}

fn internal(err: impl std::fmt::Display, request_id: &str) -> Response {
    RelayError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), "api_error", serde_json::Value::Null)
        .with_request_id(request_id)
        .into_response()
}

async fn load_token(ctx: &AppContext, auth: &AuthContext) -> Result<tokens::Model, String> {
    ctx.repo
        .token_by_id(auth.token_id)
        .await
        .map_err(|e| e.message())?
        .ok_or_else(|| "invalid token".to_string())
}

/// 令牌统计或用户统计下的已用额度
async fn used_quota(ctx: &AppContext, token: &tokens::Model) -> Result<i64, String> {
    if ctx.options.snapshot().display_token_stat {
        return Ok(token.used_quota);
    }
    ctx.repo
        .user_by_id(token.user_id)
        .await
        .map_err(|e| e.message())?
        .map(|u| u.used_quota)
        .ok_or_else(|| "user not found".to_string())
}

/// `GET /v1/dashboard/billing/subscription`
pub async fn subscription(
    State(ctx): State<AppContext>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
) -> Response {
    let token = match load_token(&ctx, &auth).await {
        Ok(token) => token,
        Err(e) => return internal(e, &request_id.0),
    };
    let options = ctx.options.snapshot();
    #[allow(clippy::cast_precision_loss)]
    let (mut remain, mut used, mut hard_limit, expired_time) = if options.display_token_stat {
        (
            token.remain_quota as f64,
            token.used_quota as f64,
            token.hard_limit_usd as f64,
            token.expired_time,
        )
    } else {
        match ctx.repo.user_by_id(token.user_id).await {
            Ok(Some(user)) => (user.quota as f64, user.used_quota as f64, 0.0, 0),
            Ok(None) => return internal("user not found", &request_id.0),
            Err(e) => return internal(e, &request_id.0),
        }
    };
    let expired_time = expired_time.max(0);
    if options.display_in_currency && options.quota_per_unit > 0.0 {
        remain /= options.quota_per_unit;
        used /= options.quota_per_unit;
        hard_limit /= options.quota_per_unit;
    }
    if token.unlimited_quota {
        hard_limit = UNLIMITED_AMOUNT;
    }
    let gpt4 = ctx
        .model_cache
        .user_group(token.user_id)
        .await
        .is_ok_and(|group| group.contains("gpt4"));

    Json(SubscriptionResponse {
        object: "billing_subscription",
        has_payment_method: true,
        soft_limit_usd: hard_limit,
        hard_limit_usd: hard_limit,
        system_hard_limit_usd: hard_limit,
        used_usd: used,
        balance_usd: remain,
        access_until: expired_time,
        status: status_label(TokenStatus::from_code(token.status)),
        gpt4,
        expire_at: format_time(expired_time, "%Y-%m-%d"),
    })
    .into_response()
}

/// `GET /v1/dashboard/billing/usage`
pub async fn usage(
    State(ctx): State<AppContext>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
) -> Response {
    let used = match load_token(&ctx, &auth).await {
        Ok(token) => used_quota(&ctx, &token).await,
        Err(e) => Err(e),
    };
    let used = match used {
        Ok(used) => used,
        Err(e) => return internal(e, &request_id.0),
    };
    let options = ctx.options.snapshot();
    #[allow(clippy::cast_precision_loss)]
    let mut amount = used as f64;
    if options.display_in_currency && options.quota_per_unit > 0.0 {
        amount /= options.quota_per_unit;
    }
    Json(UsageResponse {
        object: "list",
        total_usage: amount * 100.0,
    })
    .into_response()
}

/// `GET /v1/dashboard/billing/usage_detail`：近七日明细，新的在前
pub async fn usage_detail(
    State(ctx): State<AppContext>,
    Extension(auth): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
) -> Response {
    let now = chrono::Utc::now().timestamp();
    let rows = match ctx
        .repo
        .logs_by_token(auth.token_id, now - DETAIL_WINDOW_SECS, now)
        .await
    {
        Ok(rows) => rows,
        Err(e) => return internal(e, &request_id.0),
    };
    let per_unit = ctx.options.snapshot().quota_per_unit.max(1.0);
    #[allow(clippy::cast_precision_loss)]
    let daily_costs = rows
        .into_iter()
        .rev()
        .map(|row| UsageDetailCost {
            model: row.model_name,
            quota: row.quota as f64 / per_unit,
            request_at: format_time(row.created_at, "%Y-%m-%d %H:%M:%S"),
        })
        .collect();
    Json(UsageDetailResponse {
        object: "detail",
        daily_costs,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_labels() {
        assert_eq!(status_label(TokenStatus::Enabled), "normal");
        assert_eq!(status_label(TokenStatus::Disabled), "banned");
        assert_eq!(status_label(TokenStatus::Exhausted), "exhausted");
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0, "%Y-%m-%d"), "1970-01-01");
        assert_eq!(format_time(86_400 + 61, "%Y-%m-%d %H:%M:%S"), "1970-01-02 00:01:01");
    }
}
