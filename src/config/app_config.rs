//! # 应用配置结构定义

use serde::{Deserialize, Serialize};

/// 应用主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub sync: SyncConfig,
    pub relay: RelayConfig,
    pub rate_limit: RateLimitConfig,
}

/// HTTP 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `debug` 或 `release`
    pub mode: String,
    /// 是否在 6060 端口开启诊断接口
    pub pprof_debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            mode: "release".to_string(),
            pprof_debug: false,
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    /// 连接最长存活时间（秒）
    pub max_lifetime: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/relay.db?mode=rwc".to_string(),
            max_open_conns: 1000,
            max_idle_conns: 100,
            max_lifetime: 60,
        }
    }
}

/// Redis 配置；未配置 URL 时使用进程内存储
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    /// 连接超时（秒）
    pub connect_timeout: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout: 5,
        }
    }
}

/// 后台循环间隔（秒）；`None` 表示不启动对应循环
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 缓存 TTL 与过期文件清理间隔
    pub frequency: u64,
    pub channel_frequency: Option<u64>,
    pub channel_wakeup: Option<u64>,
    pub channel_softlimit: Option<u64>,
    pub token_alert: Option<u64>,
    pub options_frequency: Option<u64>,
    pub token_update_frequency: Option<u64>,
    pub batch_update_enabled: bool,
    pub batch_update_interval: u64,
    pub auto_activate_channel: bool,
    pub auto_activate_interval: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            frequency: 600,
            channel_frequency: None,
            channel_wakeup: Some(30),
            channel_softlimit: None,
            token_alert: None,
            options_frequency: None,
            token_update_frequency: None,
            batch_update_enabled: false,
            batch_update_interval: 5,
            auto_activate_channel: false,
            auto_activate_interval: 10,
        }
    }
}

/// 中继行为配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub retry_times: u32,
    /// 上游请求超时（秒），0 表示不限
    pub timeout: u64,
    pub proxy: Option<String>,
    pub ipv4_proxy: Option<String>,
    pub user_content_proxy: Option<String>,
    pub user_content_timeout: u64,
    pub gemini_timeout: u64,
    pub pre_consumed_quota: i64,
    pub quota_per_unit: f64,
    pub quota_remind_threshold: i64,
    /// 鉴权失败缓存时长（秒）
    pub error_cache_timeout: u64,
    pub automatic_disable_channel: bool,
    /// 允许处理图片编辑的渠道类型名
    pub image_edit_channel_kinds: Vec<String>,
    /// 分组未设置激活数时的默认值
    pub default_active_num: i32,
    pub root_user_email: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_times: 3,
            timeout: 0,
            proxy: None,
            ipv4_proxy: None,
            user_content_proxy: None,
            user_content_timeout: 30,
            gemini_timeout: 300,
            pre_consumed_quota: 500,
            quota_per_unit: 500_000.0,
            quota_remind_threshold: 1000,
            error_cache_timeout: 60,
            automatic_disable_channel: true,
            image_edit_channel_kinds: vec!["gemini".to_string()],
            default_active_num: 1,
            root_user_email: None,
        }
    }
}

/// 单个限流类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub num: u32,
    /// 窗口（秒）
    pub duration: i64,
}

impl RateLimitRule {
    #[must_use]
    pub const fn new(num: u32, duration: i64) -> Self {
        Self { num, duration }
    }
}

/// 各限流类别配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub global_web: RateLimitRule,
    pub global_api: RateLimitRule,
    pub critical: RateLimitRule,
    pub download: RateLimitRule,
    pub upload: RateLimitRule,
    pub relay: RateLimitRule,
    /// 内存限流器闲置键的过期时间（秒）
    pub memory_expiration: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_web: RateLimitRule::new(60, 180),
            global_api: RateLimitRule::new(180, 180),
            critical: RateLimitRule::new(20, 1200),
            download: RateLimitRule::new(10, 60),
            upload: RateLimitRule::new(10, 60),
            relay: RateLimitRule::new(0, 60),
            memory_expiration: 180,
        }
    }
}

impl AppConfig {
    /// 是否配置了共享 KV 存储
    #[must_use]
    pub fn redis_enabled(&self) -> bool {
        self.redis.url.as_deref().is_some_and(|url| !url.is_empty())
    }

    /// debug 模式
    #[must_use]
    pub fn is_debug(&self) -> bool {
        self.server.mode.eq_ignore_ascii_case("debug")
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be greater than 0".to_string());
        }
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.sync.frequency == 0 {
            return Err("sync.frequency must be greater than 0".to_string());
        }
        if self.sync.batch_update_enabled && self.sync.batch_update_interval == 0 {
            return Err("sync.batch_update_interval must be greater than 0".to_string());
        }
        let intervals = [
            ("sync.channel_frequency", self.sync.channel_frequency),
            ("sync.channel_wakeup", self.sync.channel_wakeup),
            ("sync.channel_softlimit", self.sync.channel_softlimit),
            ("sync.token_alert", self.sync.token_alert),
            ("sync.options_frequency", self.sync.options_frequency),
            ("sync.token_update_frequency", self.sync.token_update_frequency),
        ];
        for (name, value) in intervals {
            if value == Some(0) {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        let proxies = [
            ("relay.proxy", &self.relay.proxy),
            ("relay.ipv4_proxy", &self.relay.ipv4_proxy),
            ("relay.user_content_proxy", &self.relay.user_content_proxy),
        ];
        for (name, proxy) in proxies {
            if let Some(proxy) = proxy.as_deref().filter(|p| !p.is_empty()) {
                url::Url::parse(proxy).map_err(|e| format!("{name} is not a valid URL: {e}"))?;
            }
        }
        if self.relay.quota_per_unit <= 0.0 {
            return Err("relay.quota_per_unit must be positive".to_string());
        }
        Ok(())
    }
}
