//! # 运行时选项快照
//!
//! 由 [`AppConfig`] 初始化，并由 `options` 表覆盖；选项同步循环整体替换快照

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use super::AppConfig;
use crate::relay::ratio;

/// 只读选项快照
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeOptions {
    pub retry_times: u32,
    pub pre_consumed_quota: i64,
    pub quota_per_unit: f64,
    pub quota_remind_threshold: i64,
    pub automatic_disable_channel: bool,
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
    /// 鉴权失败缓存（秒）
    pub error_cache_timeout: u64,
    pub display_in_currency: bool,
    pub display_token_stat: bool,
    pub image_edit_channel_kinds: Vec<String>,
    /// 缓存 TTL（秒）
    pub sync_frequency: u64,
    pub default_active_num: i32,
    pub root_user_email: Option<String>,
    pub batch_update_enabled: bool,
}

impl RuntimeOptions {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retry_times: config.relay.retry_times,
            pre_consumed_quota: config.relay.pre_consumed_quota,
            quota_per_unit: config.relay.quota_per_unit,
            quota_remind_threshold: config.relay.quota_remind_threshold,
            automatic_disable_channel: config.relay.automatic_disable_channel,
            model_ratio: ratio::default_model_ratio(),
            completion_ratio: ratio::default_completion_ratio(),
            group_ratio: HashMap::from([("default".to_string(), 1.0), ("vip".to_string(), 1.0)]),
            error_cache_timeout: config.relay.error_cache_timeout,
            display_in_currency: true,
            display_token_stat: false,
            image_edit_channel_kinds: config.relay.image_edit_channel_kinds.clone(),
            sync_frequency: config.sync.frequency,
            default_active_num: config.relay.default_active_num,
            root_user_email: config.relay.root_user_email.clone(),
            batch_update_enabled: config.sync.batch_update_enabled,
        }
    }

    /// 叠加 `options` 表中的键值；无法解析的值保持原样并返回其键名
    pub fn apply_rows<'a, I>(&mut self, rows: I) -> Vec<String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut rejected = Vec::new();
        for (key, value) in rows {
            if !self.apply_one(key, value) {
                rejected.push(key.to_string());
            }
        }
        rejected
    }

    fn apply_one(&mut self, key: &str, value: &str) -> bool {
        fn parse<T: std::str::FromStr>(value: &str, slot: &mut T) -> bool {
            value.trim().parse::<T>().map(|v| *slot = v).is_ok()
        }
        fn parse_map(value: &str, slot: &mut HashMap<String, f64>) -> bool {
            serde_json::from_str::<HashMap<String, f64>>(value)
                .map(|map| *slot = map)
                .is_ok()
        }

        match key {
            "RetryTimes" => parse(value, &mut self.retry_times),
            "PreConsumedQuota" => parse(value, &mut self.pre_consumed_quota),
            "QuotaPerUnit" => parse(value, &mut self.quota_per_unit),
            "QuotaRemindThreshold" => parse(value, &mut self.quota_remind_threshold),
            "AutomaticDisableChannelEnabled" => parse(value, &mut self.automatic_disable_channel),
            "ErrorCacheTimeout" => parse(value, &mut self.error_cache_timeout),
            "DisplayInCurrencyEnabled" => parse(value, &mut self.display_in_currency),
            "DisplayTokenStatEnabled" => parse(value, &mut self.display_token_stat),
            "ModelRatio" => parse_map(value, &mut self.model_ratio),
            "CompletionRatio" => parse_map(value, &mut self.completion_ratio),
            "GroupRatio" => parse_map(value, &mut self.group_ratio),
            "ImageEditChannelKinds" => {
                self.image_edit_channel_kinds = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_lowercase)
                    .collect();
                true
            }
            "RootUserEmail" => {
                self.root_user_email = Some(value.to_string()).filter(|v| !v.is_empty());
                true
            }
            _ => false,
        }
    }

    /// 分组倍率，未配置的分组为 1
    #[must_use]
    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratio.get(group).copied().unwrap_or(1.0)
    }
}

/// 进程级选项句柄，读多写少
#[derive(Debug)]
pub struct SharedOptions {
    inner: RwLock<Arc<RuntimeOptions>>,
}

impl SharedOptions {
    #[must_use]
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            inner: RwLock::new(Arc::new(options)),
        }
    }

    /// 当前快照
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuntimeOptions> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// 原子替换快照
    pub fn replace(&self, options: RuntimeOptions) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(options);
    }

    /// 基于当前快照修改后替换
    pub fn update(&self, f: impl FnOnce(&mut RuntimeOptions)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = RuntimeOptions::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }
}
