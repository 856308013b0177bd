//! # 日志配置模块
//!
//! 订阅器初始化与结构化日志宏 `linfo!` / `ldebug!` / `lwarn!` / `lerror!`

use std::env;
use std::fmt;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 请求生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    RequestStart,
    Authentication,
    RateLimit,
    Scheduling,
    UpstreamRequest,
    Response,
    ResponseFailure,
    Billing,
    BackgroundTask,
    HealthCheck,
    Startup,
    Shutdown,
    Configuration,
    Cache,
    Db,
    Internal,
    Error,
}

impl LogStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestStart => "request_start",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Scheduling => "scheduling",
            Self::UpstreamRequest => "upstream_request",
            Self::Response => "response",
            Self::ResponseFailure => "response_failure",
            Self::Billing => "billing",
            Self::BackgroundTask => "background_task",
            Self::HealthCheck => "health_check",
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Configuration => "configuration",
            Self::Cache => "cache",
            Self::Db => "db",
            Self::Internal => "internal",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 产生日志的子系统
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogComponent {
    Main,
    ServerSetup,
    Config,
    Database,
    Cache,
    Auth,
    RateLimiter,
    ChannelStore,
    Selector,
    Relay,
    Adaptor,
    Billing,
    Monitor,
    Tasks,
    Options,
    Media,
    Notifier,
    Diagnostics,
}

impl LogComponent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::ServerSetup => "server_setup",
            Self::Config => "config",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Auth => "auth",
            Self::RateLimiter => "rate_limiter",
            Self::ChannelStore => "channel_store",
            Self::Selector => "selector",
            Self::Relay => "relay",
            Self::Adaptor => "adaptor",
            Self::Billing => "billing",
            Self::Monitor => "monitor",
            Self::Tasks => "tasks",
            Self::Options => "options",
            Self::Media => "media",
            Self::Notifier => "notifier",
            Self::Diagnostics => "diagnostics",
        }
    }
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log_event {
    ($level:ident, $rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr $(, $($fields:tt)+)?) => {
        ::tracing::$level!(
            request_id = %$rid,
            stage = %$stage,
            component = %$component,
            operation = $op,
            $($($fields)+,)?
            "{}",
            $msg
        )
    };
}

/// `linfo!(request_id, stage, component, operation, message, fields...)`
#[macro_export]
macro_rules! linfo {
    ($($args:tt)+) => { $crate::__log_event!(info, $($args)+) };
}

/// 调试级别结构化日志
#[macro_export]
macro_rules! ldebug {
    ($($args:tt)+) => { $crate::__log_event!(debug, $($args)+) };
}

/// 警告级别结构化日志
#[macro_export]
macro_rules! lwarn {
    ($($args:tt)+) => { $crate::__log_event!(warn, $($args)+) };
}

/// 错误级别结构化日志
#[macro_export]
macro_rules! lerror {
    ($($args:tt)+) => { $crate::__log_event!(error, $($args)+) };
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先；否则按传入级别（缺省 `info`）组合默认过滤规则
pub fn init_optimized_logging(log_level: Option<&String>) {
    let level = log_level.map_or("info", String::as_str);
    let default_filter = format!(
        "{level},api_relay=debug,sqlx::query=off,sea_orm::query=warn,sqlx=warn,hyper=info"
    );
    let log_filter = env::var("RUST_LOG").unwrap_or(default_filter);

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(
            tracing_fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}

/// 根据 `GIN_MODE` 推导日志级别：debug 模式下默认输出调试日志
#[must_use]
pub fn level_for_mode(mode: &str, explicit: Option<&String>) -> String {
    explicit.cloned().unwrap_or_else(|| {
        if mode.eq_ignore_ascii_case("debug") {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_mode() {
        assert_eq!(level_for_mode("debug", None), "debug");
        assert_eq!(level_for_mode("release", None), "info");
        assert_eq!(level_for_mode("debug", Some(&"warn".to_string())), "warn");
    }

    #[test]
    fn test_macros_expand_with_fields() {
        let channel_id = 7;
        crate::linfo!(
            "rid",
            LogStage::Scheduling,
            LogComponent::Selector,
            "select",
            "selected channel",
            channel_id = channel_id,
            model = %"gpt-4o"
        );
        crate::lwarn!("system", LogStage::Startup, LogComponent::Main, "plain", &format!("no fields {channel_id}"));
    }
}
