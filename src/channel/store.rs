//! # 渠道存储与选择
//!
//! 渠道实例按 ID 存放在 arena 中，索引为 `group → model → [id]`，
//! 按优先级降序排列；休眠状态按渠道单独加锁

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use entity::abilities;
use serde::Serialize;

use super::types::{Channel, ChannelStatus};
use crate::cache::{CacheKey, KvStore};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::repository::Repository;
use crate::{ldebug, linfo, lwarn};

const GENERATE_LOCK_TTL: Duration = Duration::from_secs(10);

/// 渠道索引
#[derive(Debug, Default)]
pub struct ChannelIndex {
    channels: HashMap<i32, Arc<Channel>>,
    by_group_model: HashMap<String, HashMap<String, Vec<i32>>>,
}

impl ChannelIndex {
    /// 由启用的渠道和能力行构造索引
    #[must_use]
    pub fn build(channels: Vec<Channel>, abilities: &[abilities::Model]) -> Self {
        let channels: HashMap<i32, Arc<Channel>> = channels
            .into_iter()
            .filter(|c| c.status == ChannelStatus::Enabled)
            .map(|c| (c.id, Arc::new(c)))
            .collect();

        let mut by_group_model: HashMap<String, HashMap<String, Vec<i32>>> = HashMap::new();
        for ability in abilities.iter().filter(|a| a.enabled) {
            if !channels.contains_key(&ability.channel_id) {
                continue;
            }
            let ids = by_group_model
                .entry(ability.group.clone())
                .or_default()
                .entry(ability.model.clone())
                .or_default();
            if !ids.contains(&ability.channel_id) {
                ids.push(ability.channel_id);
            }
        }

        for models in by_group_model.values_mut() {
            for ids in models.values_mut() {
                ids.sort_by(|a, b| {
                    let pa = channels[a].priority;
                    let pb = channels[b].priority;
                    pb.cmp(&pa).then(a.cmp(b))
                });
            }
        }

        Self {
            channels,
            by_group_model,
        }
    }

    fn candidates(&self, group: &str, model: &str) -> Vec<Arc<Channel>> {
        self.by_group_model
            .get(group)
            .and_then(|models| models.get(model))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.channels.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// 休眠条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SleepEntry {
    pub channel_id: i32,
    pub model: String,
    pub wake_at: i64,
}

/// 诊断快照
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStoreSnapshot {
    pub channels: usize,
    pub groups: HashMap<String, usize>,
    pub sleeping: Vec<SleepEntry>,
}

/// 渠道存储
pub struct ChannelStore {
    index: RwLock<Arc<ChannelIndex>>,
    sleeps: DashMap<i32, HashMap<String, i64>>,
    repo: Repository,
    kv: Arc<KvStore>,
}

impl std::fmt::Debug for ChannelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStore")
            .field("sleeping_channels", &self.sleeps.len())
            .finish_non_exhaustive()
    }
}

impl ChannelStore {
    #[must_use]
    pub fn new(repo: Repository, kv: Arc<KvStore>) -> Self {
        Self {
            index: RwLock::new(Arc::new(ChannelIndex::default())),
            sleeps: DashMap::new(),
            repo,
            kv,
        }
    }

    fn current(&self) -> Arc<ChannelIndex> {
        Arc::clone(&self.index.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// 替换整个索引
    pub fn install(&self, index: ChannelIndex) {
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(index);
    }

    /// 按 ID 获取启用中的渠道
    #[must_use]
    pub fn get(&self, channel_id: i32) -> Option<Arc<Channel>> {
        self.current().channels.get(&channel_id).cloned()
    }

    /// 为 (group, model) 选择渠道
    #[must_use]
    pub fn select(&self, group: &str, model: &str, ignore_top: bool) -> Option<Arc<Channel>> {
        self.select_with(group, model, ignore_top, |range| fastrand::usize(range))
    }

    /// `pick` 在给定区间内返回一个下标
    pub fn select_with<F>(
        &self,
        group: &str,
        model: &str,
        ignore_top: bool,
        pick: F,
    ) -> Option<Arc<Channel>>
    where
        F: FnOnce(Range<usize>) -> usize,
    {
        let candidates: Vec<Arc<Channel>> = self
            .current()
            .candidates(group, model)
            .into_iter()
            .filter(|c| !self.is_sleeping(c.id, model))
            .collect();

        let top_priority = candidates.first()?.priority;
        let end_idx = candidates
            .iter()
            .position(|c| c.priority < top_priority)
            .unwrap_or(candidates.len());

        let range = if ignore_top && end_idx < candidates.len() {
            end_idx..candidates.len()
        } else {
            0..end_idx
        };
        let idx = pick(range.clone()).clamp(range.start, range.end - 1);
        candidates.get(idx).cloned()
    }

    #[must_use]
    pub fn is_sleeping(&self, channel_id: i32, model: &str) -> bool {
        self.sleeps
            .get(&channel_id)
            .is_some_and(|models| models.contains_key(model))
    }

    /// 标记 (渠道, 模型) 在 `wake_at` 之前不可用，返回是否为新条目
    pub fn sleep(&self, group: &str, model: &str, channel_id: i32, wake_at: i64) -> bool {
        let mut models = self.sleeps.entry(channel_id).or_default();
        let fresh = models.insert(model.to_string(), wake_at).is_none();
        linfo!(
            "system",
            LogStage::HealthCheck,
            LogComponent::ChannelStore,
            "channel_sleep",
            "渠道模型进入休眠",
            group = group,
            model = model,
            channel_id = channel_id,
            wake_at = wake_at
        );
        fresh
    }

    /// 唤醒单个条目，仅当到期时清除
    pub fn wake(&self, channel_id: i32, model: &str, now: i64) -> bool {
        let Some(mut models) = self.sleeps.get_mut(&channel_id) else {
            return false;
        };
        let due = models.get(model).is_some_and(|&at| at <= now);
        if due {
            models.remove(model);
        }
        let emptied = models.is_empty();
        drop(models);
        if emptied {
            self.sleeps.remove_if(&channel_id, |_, m| m.is_empty());
        }
        due
    }

    /// 清除所有到期条目，返回清除数量
    pub fn wake_all(&self, now: i64) -> usize {
        let mut woken = 0;
        for mut entry in self.sleeps.iter_mut() {
            let before = entry.len();
            entry.retain(|_, at| *at > now);
            woken += before - entry.len();
        }
        self.sleeps.retain(|_, models| !models.is_empty());
        if woken > 0 {
            ldebug!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::ChannelStore,
                "channels_woken",
                "已唤醒休眠渠道",
                count = woken
            );
        }
        woken
    }

    #[must_use]
    pub fn sleeping_entries(&self) -> Vec<SleepEntry> {
        let mut entries: Vec<SleepEntry> = self
            .sleeps
            .iter()
            .flat_map(|row| {
                let channel_id = *row.key();
                row.value()
                    .iter()
                    .map(|(model, &wake_at)| SleepEntry {
                        channel_id,
                        model: model.clone(),
                        wake_at,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_by(|a, b| a.channel_id.cmp(&b.channel_id).then(a.model.cmp(&b.model)));
        entries
    }

    /// 从数据库重建索引；共享存储下由重建锁串行化，未拿到锁则跳过
    pub async fn rebuild(&self) -> Result<bool> {
        let lock_key = CacheKey::ChannelGenerateLock.build();
        if self.kv.is_shared()
            && !self
                .kv
                .set_nx(&lock_key, "1", Some(GENERATE_LOCK_TTL))
                .await?
        {
            lwarn!(
                "system",
                LogStage::Cache,
                LogComponent::ChannelStore,
                "rebuild_lock_busy",
                "渠道索引正在由其他实例重建，跳过本次"
            );
            return Ok(false);
        }

        let result = self.load_index().await;

        if self.kv.is_shared() {
            if let Err(e) = self.kv.del(&lock_key).await {
                lwarn!(
                    "system",
                    LogStage::Cache,
                    LogComponent::ChannelStore,
                    "rebuild_unlock_failed",
                    "释放渠道重建锁失败",
                    error = %e
                );
            }
        }

        let index = result?;
        let channel_count = index.channels.len();
        self.install(index);
        linfo!(
            "system",
            LogStage::Cache,
            LogComponent::ChannelStore,
            "channels_synced",
            "渠道索引已重建",
            channels = channel_count
        );
        Ok(true)
    }

    async fn load_index(&self) -> Result<ChannelIndex> {
        let channels = self
            .repo
            .channels_with_status(ChannelStatus::Enabled.code())
            .await?
            .into_iter()
            .map(Channel::from_model)
            .collect();
        let abilities = self.repo.enabled_abilities().await?;
        Ok(ChannelIndex::build(channels, &abilities))
    }

    #[must_use]
    pub fn snapshot(&self) -> ChannelStoreSnapshot {
        let index = self.current();
        ChannelStoreSnapshot {
            channels: index.channels.len(),
            groups: index
                .by_group_model
                .iter()
                .map(|(group, models)| (group.clone(), models.len()))
                .collect(),
            sleeping: self.sleeping_entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::testing::fixtures::channel;

    fn ability(group: &str, model: &str, channel_id: i32, priority: i64) -> abilities::Model {
        abilities::Model {
            group: group.into(),
            model: model.into(),
            channel_id,
            enabled: true,
            priority,
        }
    }

    fn store_with(channels: Vec<Channel>) -> ChannelStore {
        let abilities: Vec<_> = channels
            .iter()
            .flat_map(|c| {
                c.models
                    .iter()
                    .map(|m| ability("default", m, c.id, c.priority))
                    .collect::<Vec<_>>()
            })
            .collect();
        let store = ChannelStore::new(
            Repository::new(Arc::new(sea_orm::DatabaseConnection::Disconnected)),
            Arc::new(KvStore::memory()),
        );
        store.install(ChannelIndex::build(channels, &abilities));
        store
    }

    fn tiers() -> ChannelStore {
        store_with(vec![
            channel(1, ChannelKind::OpenAi, 10, &["gpt-4o"]),
            channel(2, ChannelKind::OpenAi, 10, &["gpt-4o"]),
            channel(3, ChannelKind::OpenAi, 5, &["gpt-4o"]),
            channel(4, ChannelKind::OpenAi, 1, &["gpt-4o"]),
        ])
    }

    #[test]
    fn test_select_stays_in_top_tier() {
        let store = tiers();
        let mut seen = None;
        let picked = store.select_with("default", "gpt-4o", false, |r| {
            seen = Some(r.clone());
            r.end - 1
        });
        assert_eq!(seen, Some(0..2));
        assert_eq!(picked.map(|c| c.id), Some(2));
    }

    #[test]
    fn test_select_ignore_top_uses_lower_tiers() {
        let store = tiers();
        let mut seen = None;
        let picked = store.select_with("default", "gpt-4o", true, |r| {
            seen = Some(r.clone());
            r.start
        });
        assert_eq!(seen, Some(2..4));
        assert_eq!(picked.map(|c| c.id), Some(3));
    }

    #[test]
    fn test_ignore_top_with_single_tier_falls_back() {
        let store = store_with(vec![
            channel(1, ChannelKind::OpenAi, 10, &["gpt-4o"]),
            channel(2, ChannelKind::OpenAi, 10, &["gpt-4o"]),
        ]);
        let mut seen = None;
        store.select_with("default", "gpt-4o", true, |r| {
            seen = Some(r.clone());
            r.start
        });
        assert_eq!(seen, Some(0..2));
    }

    #[test]
    fn test_sleeping_channel_is_skipped_until_woken() {
        let store = store_with(vec![
            channel(1, ChannelKind::Gemini, 10, &["gemini-1.5-pro"]),
            channel(2, ChannelKind::Gemini, 5, &["gemini-1.5-pro"]),
        ]);
        assert!(store.sleep("default", "gemini-1.5-pro", 1, 1_060));
        for _ in 0..10 {
            let picked = store.select("default", "gemini-1.5-pro", false);
            assert_eq!(picked.map(|c| c.id), Some(2));
        }
        assert_eq!(store.wake_all(1_059), 0);
        assert!(store.is_sleeping(1, "gemini-1.5-pro"));
        assert_eq!(store.wake_all(1_060), 1);
        assert!(!store.is_sleeping(1, "gemini-1.5-pro"));
        assert!(store.sleeping_entries().is_empty());
    }

    #[test]
    fn test_wake_ignores_renewed_sleep() {
        let store = tiers();
        store.sleep("default", "gpt-4o", 1, 100);
        store.sleep("default", "gpt-4o", 1, 200);
        assert!(!store.wake(1, "gpt-4o", 150));
        assert!(store.wake(1, "gpt-4o", 200));
    }

    #[test]
    fn test_no_candidates() {
        let store = tiers();
        assert!(store.select("default", "claude-3", false).is_none());
        assert!(store.select("vip", "gpt-4o", false).is_none());
        for id in 1..=4 {
            store.sleep("default", "gpt-4o", id, i64::MAX);
        }
        assert!(store.select("default", "gpt-4o", false).is_none());
    }
}
