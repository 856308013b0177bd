//! # 令牌认证中间件

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use super::key::AuthUtils;
use super::{AuthContext, client_ip};
use crate::app::AppContext;
use crate::cache::CacheKey;
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::relay::body::{CachedBody, request_model};
use crate::repository::ROLE_ADMIN;
use crate::server::RequestId;
use crate::{ldebug, lerror, lwarn};

/// 负缓存条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAuthError {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub response: serde_json::Value,
}

fn should_check_model(path: &str) -> bool {
    ["/v1/completions", "/v1/chat/completions", "/v1/images", "/v1/audio"]
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// 按路径补全默认模型
fn default_model(path: &str, model: String) -> String {
    if !model.is_empty() {
        return model;
    }
    if path.starts_with("/v1/moderations") {
        return "text-moderation-stable".to_string();
    }
    if path.ends_with("embeddings") {
        if let Some(rest) = path.strip_prefix("/v1/engines/") {
            return rest.split('/').next().unwrap_or_default().to_string();
        }
    }
    if path.starts_with("/v1/images/generations") {
        return "dall-e-2".to_string();
    }
    if path.starts_with("/v1/audio/transcriptions") || path.starts_with("/v1/audio/translations") {
        return "whisper-1".to_string();
    }
    model
}

/// 令牌是否允许在该 IP 使用
#[must_use]
pub fn ip_in_subnets(ip: &str, subnets: &str) -> bool {
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return false;
    };
    subnets
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .any(|subnet| match subnet.parse::<IpNetwork>() {
            Ok(network) => network.contains(addr),
            Err(_) => subnet.parse::<IpAddr>().is_ok_and(|single| single == addr),
        })
}

struct Rejection<'a> {
    ctx: &'a AppContext,
    request_id: &'a str,
    api_key: &'a str,
}

impl Rejection<'_> {
    /// 构造错误响应；4xx 且需要缓存时写入负缓存
    async fn abort(&self, status: StatusCode, message: &str, need_cache: bool) -> Response {
        let error = RelayError::abort(status, message).with_request_id(self.request_id);
        let body = error.body();
        if need_cache && status.as_u16() < 500 && !self.api_key.is_empty() {
            let entry = CachedAuthError {
                status_code: status.as_u16(),
                response: body.clone(),
            };
            let ttl = Duration::from_secs(self.ctx.options.snapshot().error_cache_timeout.max(1));
            match serde_json::to_string(&entry) {
                Ok(raw) => {
                    let key = CacheKey::AuthError(self.api_key).build();
                    if let Err(e) = self.ctx.kv.set_nx(&key, &raw, Some(ttl)).await {
                        lwarn!(self.request_id, LogStage::Authentication, LogComponent::Auth, "auth_cache_write_failed", "写入鉴权负缓存失败", error = %e);
                    }
                }
                Err(e) => {
                    lwarn!(self.request_id, LogStage::Authentication, LogComponent::Auth, "auth_cache_encode_failed", "编码鉴权负缓存失败", error = %e);
                }
            }
        }
        lerror!(
            self.request_id,
            LogStage::Authentication,
            LogComponent::Auth,
            "auth_rejected",
            message,
            status = status.as_u16()
        );
        (status, axum::Json(body)).into_response()
    }
}

/// 令牌认证：负缓存、令牌状态、网段、用户状态、模型白名单、指定渠道
pub async fn token_auth(
    State(ctx): State<AppContext>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();
    let path = request.uri().path().to_string();
    let parsed = AuthUtils::parse_authorization(request.headers());
    let reject = Rejection {
        ctx: &ctx,
        request_id: &request_id,
        api_key: &parsed.api_key,
    };

    if !parsed.api_key.is_empty() {
        let cache_key = CacheKey::AuthError(&parsed.api_key).build();
        if let Ok(Some(cached)) = ctx.kv.get_json::<CachedAuthError>(&cache_key).await {
            ldebug!(
                &request_id,
                LogStage::Authentication,
                LogComponent::Auth,
                "auth_negative_cache_hit",
                "命中鉴权负缓存"
            );
            let status =
                StatusCode::from_u16(cached.status_code).unwrap_or(StatusCode::UNAUTHORIZED);
            return (status, axum::Json(cached.response)).into_response();
        }
    }

    let token = match ctx.token_validator.validate_user_token(&parsed.key).await {
        Ok(token) => token,
        Err(message) => return reject.abort(StatusCode::UNAUTHORIZED, &message, true).await,
    };

    let ip = client_ip(&request);
    if let Some(subnet) = token.subnet.as_deref().filter(|s| !s.is_empty()) {
        if !ip_in_subnets(&ip, subnet) {
            let message = format!("该令牌只能在指定网段使用：{subnet}，当前 ip：{ip}");
            return reject.abort(StatusCode::FORBIDDEN, &message, true).await;
        }
    }

    match ctx.model_cache.user_enabled(token.user_id).await {
        Ok(true) => {}
        Ok(false) => {
            return reject
                .abort(StatusCode::FORBIDDEN, "User has been banned", true)
                .await;
        }
        Err(e) => {
            return reject
                .abort(StatusCode::INTERNAL_SERVER_ERROR, &e.message(), true)
                .await;
        }
    }

    let body = request.extensions().get::<CachedBody>().cloned();
    let model = match body {
        Some(body) => request_model(request.headers(), &body.0).await,
        None => Ok(String::new()),
    };
    let request_model = match model {
        Ok(model) => default_model(&path, model),
        Err(e) if should_check_model(&path) => {
            return reject
                .abort(StatusCode::BAD_REQUEST, &e.message(), true)
                .await;
        }
        Err(_) => default_model(&path, String::new()),
    };

    let available_models = token
        .models
        .as_deref()
        .filter(|m| !m.is_empty())
        .map(crate::repository::split_list);
    if let Some(models) = &available_models {
        if !request_model.is_empty() && !models.iter().any(|m| *m == request_model) {
            let message = format!("该令牌无权使用模型：{request_model}");
            return reject.abort(StatusCode::FORBIDDEN, &message, true).await;
        }
    }

    let role = match ctx.repo.user_role(token.user_id).await {
        Ok(role) => role,
        Err(e) => {
            return reject
                .abort(StatusCode::INTERNAL_SERVER_ERROR, &e.message(), false)
                .await;
        }
    };
    let is_admin = role >= ROLE_ADMIN;
    if parsed.channel_id.is_some() && !is_admin {
        return reject
            .abort(StatusCode::FORBIDDEN, "普通用户不支持指定渠道", false)
            .await;
    }
    let specific_channel_id = path
        .strip_prefix("/v1/proxy/")
        .and_then(|rest| rest.split('/').next())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or(parsed.channel_id.clone());

    let group = match ctx.model_cache.user_group(token.user_id).await {
        Ok(group) => group,
        Err(e) => {
            return reject
                .abort(StatusCode::INTERNAL_SERVER_ERROR, &e.message(), false)
                .await;
        }
    };

    request.extensions_mut().insert(AuthContext {
        api_key: parsed.api_key.clone(),
        key: parsed.key.clone(),
        token_id: token.id,
        token_name: token.name.clone(),
        user_id: token.user_id,
        group,
        request_model,
        available_models,
        specific_channel_id,
        rpm_limit: token.rpm_limit,
        dpm_limit: token.dpm_limit,
        tpm_limit: token.tpm_limit,
        moderations_enable: token.moderations_enable,
        is_admin,
        client_ip: ip,
    });
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_models_by_path() {
        assert_eq!(default_model("/v1/moderations", String::new()), "text-moderation-stable");
        assert_eq!(
            default_model("/v1/engines/text-embedding-ada-002/embeddings", String::new()),
            "text-embedding-ada-002"
        );
        assert_eq!(default_model("/v1/images/generations", String::new()), "dall-e-2");
        assert_eq!(default_model("/v1/audio/translations", String::new()), "whisper-1");
        assert_eq!(default_model("/v1/chat/completions", "gpt-4o".into()), "gpt-4o");
        assert_eq!(default_model("/v1/chat/completions", String::new()), "");
    }

    #[test]
    fn test_subnet_membership() {
        assert!(ip_in_subnets("10.1.2.3", "192.168.0.0/16, 10.0.0.0/8"));
        assert!(ip_in_subnets("1.2.3.4", "1.2.3.4"));
        assert!(!ip_in_subnets("172.16.0.1", "10.0.0.0/8"));
        assert!(!ip_in_subnets("not-an-ip", "10.0.0.0/8"));
    }

    #[test]
    fn test_model_check_paths() {
        assert!(should_check_model("/v1/chat/completions"));
        assert!(should_check_model("/v1/images/edits"));
        assert!(!should_check_model("/v1/embeddings"));
        assert!(!should_check_model("/v1/dashboard/billing/usage"));
    }
}
