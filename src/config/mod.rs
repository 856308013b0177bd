//! # 配置管理模块
//!
//! TOML 文件 + 环境变量覆盖，以及运行期可热更新的选项快照

mod app_config;
mod options;

pub use app_config::{
    AppConfig, DatabaseConfig, RateLimitConfig, RateLimitRule, RedisConfig, RelayConfig,
    ServerConfig, SyncConfig,
};
pub use options::{RuntimeOptions, SharedOptions};

use crate::error::{ProxyError, Result};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 解析配置文件路径：`API_RELAY_CONFIG_PATH` 优先，否则 `config/config.{APP_ENV}.toml`
#[must_use]
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = env::var("API_RELAY_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());
    PathBuf::from(format!("config/config.{app_env}.toml"))
}

/// 加载配置：文件（可缺省）→ 环境变量覆盖 → 校验
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let path = config_path(explicit);
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ProxyError::config_with_source(format!("读取配置文件失败: {}", path.display()), e)
        })?;
        toml::from_str::<AppConfig>(&content)?
    } else {
        linfo!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "config_file_missing",
            "配置文件不存在，使用默认配置",
            path = %path.display()
        );
        AppConfig::default()
    };

    apply_env_overrides(&mut config)?;
    config.validate().map_err(ProxyError::config)?;
    Ok(config)
}

/// 变量来源；测试中以内存表代替进程环境
trait EnvSource {
    fn raw(&self, name: &str) -> Option<String>;

    fn value(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.value(name)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| ProxyError::config(format!("failed to parse {name}: {e}")))
            })
            .transpose()
    }
}

impl<F> EnvSource for F
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// 环境变量覆盖文件配置；数值格式错误视为致命错误
pub fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    apply_overrides_from(config, &|name: &str| env::var(name).ok())
}

fn apply_overrides_from(config: &mut AppConfig, env: &impl EnvSource) -> Result<()> {
    if let Some(port) = env.parse::<u16>("PORT")? {
        config.server.port = port;
    }
    if let Some(mode) = env.value("GIN_MODE") {
        config.server.mode = mode;
    }
    if let Some(flag) = env.value("PPROF_DEBUG") {
        config.server.pprof_debug = flag == "true";
    }
    if let Some(url) = env.value("REDIS_CONN_STRING") {
        config.redis.url = Some(url);
    }
    if let Some(dsn) = env.value("SQL_DSN") {
        config.database.url = dsn;
    }
    if let Some(open) = env.parse::<u32>("SQL_MAX_OPEN_CONNS")? {
        config.database.max_open_conns = open;
    }
    if let Some(idle) = env.parse::<u32>("SQL_MAX_IDLE_CONNS")? {
        config.database.max_idle_conns = idle;
    }
    if let Some(lifetime) = env.parse::<u64>("SQL_MAX_LIFETIME")? {
        config.database.max_lifetime = lifetime;
    }
    if let Some(frequency) = env.parse::<u64>("SYNC_FREQUENCY")? {
        config.sync.frequency = frequency;
    }

    let optional_intervals: [(&str, &mut Option<u64>); 6] = [
        ("SYNC_CHANNEL_FREQUENCY", &mut config.sync.channel_frequency),
        ("SYNC_CHANNEL_WAKEUP", &mut config.sync.channel_wakeup),
        ("SYNC_CHANNEL_SOFTLIMIT", &mut config.sync.channel_softlimit),
        ("SYNC_TOKEN_ALERT", &mut config.sync.token_alert),
        ("SYNC_OPTIONS_FREQUENCY", &mut config.sync.options_frequency),
        ("TOKEN_UPDATE_FREQUENCY", &mut config.sync.token_update_frequency),
    ];
    for (name, slot) in optional_intervals {
        if let Some(value) = env.parse::<u64>(name)? {
            *slot = Some(value);
        }
    }

    if let Some(flag) = env.value("BATCH_UPDATE_ENABLED") {
        config.sync.batch_update_enabled = flag == "true";
    }
    if let Some(interval) = env.parse::<u64>("BATCH_UPDATE_INTERVAL")? {
        config.sync.batch_update_interval = interval;
    }
    if let Some(flag) = env.value("AUTO_ACTIVATE_CHANNEL") {
        config.sync.auto_activate_channel = flag == "true";
    }
    if let Some(timeout) = env.parse::<u64>("RELAY_TIMEOUT")? {
        config.relay.timeout = timeout;
    }
    if let Some(proxy) = env.value("RELAY_PROXY") {
        config.relay.proxy = Some(proxy);
    }
    if let Some(proxy) = env.value("RELAY_IPV4_PROXY") {
        config.relay.ipv4_proxy = Some(proxy);
    }
    if let Some(proxy) = env.value("USER_CONTENT_REQUEST_PROXY") {
        config.relay.user_content_proxy = Some(proxy);
    }
    if let Some(timeout) = env.parse::<u64>("USER_CONTENT_REQUEST_TIMEOUT")? {
        config.relay.user_content_timeout = timeout;
    }
    if let Some(timeout) = env.parse::<u64>("GEMINI_TIMEOUT")? {
        config.relay.gemini_timeout = timeout;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_env_overrides_apply() {
        let env = vars(&[
            ("PORT", "8088"),
            ("GIN_MODE", "debug"),
            ("SYNC_CHANNEL_WAKEUP", "15"),
            ("BATCH_UPDATE_ENABLED", "true"),
            ("RELAY_PROXY", "  "),
        ]);
        let mut config = AppConfig::default();
        apply_overrides_from(&mut config, &env).unwrap();
        assert_eq!(config.server.port, 8088);
        assert!(config.is_debug());
        assert_eq!(config.sync.channel_wakeup, Some(15));
        assert!(config.sync.batch_update_enabled);
        // 空白值视为未设置
        assert_eq!(config.relay.proxy, None);
    }

    #[test]
    fn test_malformed_number_is_fatal() {
        let mut config = AppConfig::default();
        let err = apply_overrides_from(&mut config, &vars(&[("SYNC_FREQUENCY", "ten")])).unwrap_err();
        assert!(err.to_string().contains("SYNC_FREQUENCY"));
    }

    #[test]
    fn test_database_pool_overrides() {
        let env = vars(&[("SQL_MAX_OPEN_CONNS", "20"), ("SQL_MAX_IDLE_CONNS", "5"), ("SQL_MAX_LIFETIME", "30")]);
        let mut config = AppConfig::default();
        apply_overrides_from(&mut config, &env).unwrap();
        assert_eq!(config.database.max_open_conns, 20);
        assert_eq!(config.database.max_idle_conns, 5);
        assert_eq!(config.database.max_lifetime, 30);
    }

    #[test]
    fn test_validate_rejects_bad_proxy() {
        let mut config = AppConfig::default();
        config.relay.proxy = Some("not a url".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_sections_are_optional() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [rate_limit.relay]
            num = 3
            duration = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.rate_limit.relay.num, 3);
        assert_eq!(config.relay.retry_times, 3);
        assert!(config.validate().is_ok());
    }
}
