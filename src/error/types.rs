//! # 错误类型定义

use axum::http::StatusCode;
use thiserror::Error;

use super::ErrorCategory;

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 数据库相关错误
    #[error("数据库错误: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 缓存相关错误
    #[error("缓存错误: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 网络通信错误
    #[error("网络错误: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 上游返回了非预期响应
    #[error("上游错误: {message}")]
    Upstream {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 鉴权失败
    #[error("认证错误: {message}")]
    Authentication {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 额度不足
    #[error("额度错误: {message}")]
    Quota {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 速率限制
    #[error("速率限制: {message}")]
    RateLimit {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 请求参数校验失败
    #[error("参数错误: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO 错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 服务器初始化错误
    #[error("服务器初始化错误: {message}")]
    ServerInit {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 附加了上下文的错误
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProxyError>,
    },
}

macro_rules! constructors {
    ($($variant:ident => $plain:ident, $with_source:ident;)*) => {
        impl ProxyError {
            $(
                #[doc = concat!("创建 `", stringify!($variant), "` 错误")]
                pub fn $plain<T: Into<String>>(message: T) -> Self {
                    Self::$variant {
                        message: message.into(),
                        source: None,
                    }
                }

                #[doc = concat!("创建带来源的 `", stringify!($variant), "` 错误")]
                pub fn $with_source<T: Into<String>, E: Into<anyhow::Error>>(
                    message: T,
                    source: E,
                ) -> Self {
                    Self::$variant {
                        message: message.into(),
                        source: Some(source.into()),
                    }
                }
            )*
        }
    };
}

constructors! {
    Config => config, config_with_source;
    Database => database, database_with_source;
    Cache => cache, cache_with_source;
    Network => network, network_with_source;
    Upstream => upstream, upstream_with_source;
    Authentication => authentication, authentication_with_source;
    Quota => quota, quota_with_source;
    RateLimit => rate_limit, rate_limit_with_source;
    Validation => validation, validation_with_source;
    Internal => internal, internal_with_source;
    Serialization => serialization, serialization_with_source;
    ServerInit => server_init, server_init_with_source;
}

impl ProxyError {
    /// 将错误转换为HTTP状态码和错误代码
    #[must_use]
    pub fn to_http_response_parts(&self) -> (StatusCode, &str) {
        match self {
            Self::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            Self::Database { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            Self::Cache { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "cache_error"),
            Self::Network { .. } => (StatusCode::BAD_GATEWAY, "network_error"),
            Self::Upstream { .. } => (StatusCode::BAD_GATEWAY, "upstream_error"),
            Self::Authentication { .. } => (StatusCode::UNAUTHORIZED, "authentication_error"),
            Self::Quota { .. } => (StatusCode::FORBIDDEN, "insufficient_quota"),
            Self::RateLimit { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded"),
            Self::Validation { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::Internal { .. } | Self::ServerInit { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            Self::Serialization { .. } => (StatusCode::BAD_REQUEST, "serialization_error"),
            Self::Io { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            Self::Context { source, .. } => source.to_http_response_parts(),
        }
    }

    /// 错误归属
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        if self.to_http_response_parts().0.is_client_error() {
            ErrorCategory::Client
        } else {
            ErrorCategory::Server
        }
    }

    /// 不含变体前缀的原始消息
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Config { message, .. }
            | Self::Database { message, .. }
            | Self::Cache { message, .. }
            | Self::Network { message, .. }
            | Self::Upstream { message, .. }
            | Self::Authentication { message, .. }
            | Self::Quota { message, .. }
            | Self::RateLimit { message, .. }
            | Self::Validation { message, .. }
            | Self::Internal { message, .. }
            | Self::Serialization { message, .. }
            | Self::Io { message, .. }
            | Self::ServerInit { message, .. } => message.clone(),
            Self::Context { context, source } => format!("{context}: {}", source.message()),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: "文件操作失败".to_string(),
            source: Some(err.into()),
        }
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML解析失败", err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source("JSON处理失败", err)
    }
}

impl From<sea_orm::DbErr> for ProxyError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::database_with_source("数据库操作失败", err)
    }
}

impl From<redis::RedisError> for ProxyError {
    fn from(err: redis::RedisError) -> Self {
        Self::cache_with_source("Redis操作失败", err)
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        Self::network_with_source("HTTP请求失败", err)
    }
}
