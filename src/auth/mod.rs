//! # 认证模块
//!
//! API Key 解析、令牌校验与认证中间件

pub mod key;
pub mod middleware;
pub mod token;

pub use key::{AuthUtils, ParsedKey};
pub use middleware::{CachedAuthError, token_auth};
pub use token::{TokenStatus, TokenValidator};

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};

/// 认证通过后附加在请求上的调用方信息
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub api_key: String,
    pub key: String,
    pub token_id: i32,
    pub token_name: String,
    pub user_id: i32,
    pub group: String,
    pub request_model: String,
    pub available_models: Option<Vec<String>>,
    pub specific_channel_id: Option<String>,
    pub rpm_limit: i32,
    pub dpm_limit: i32,
    pub tpm_limit: i32,
    pub moderations_enable: bool,
    pub is_admin: bool,
    pub client_ip: String,
}

/// 客户端 IP：优先代理头，其次连接地址
#[must_use]
pub fn client_ip(request: &Request) -> String {
    let headers = request.headers();
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return real_ip.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "127.0.0.1".to_string(), |info| info.0.ip().to_string())
}
