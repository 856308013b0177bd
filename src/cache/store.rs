//! # 键值存储
//!
//! 进程内存储与 Redis 的枚举分发，提供字符串与列表两类操作

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone)]
enum StoredValue {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: StoredValue, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// 进程内存储，语义对齐 Redis 的对应命令
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, StoredEntry>,
}

fn wrong_type(key: &str) -> ProxyError {
    ProxyError::cache(format!("WRONGTYPE operation against key {key}"))
}

/// Redis 风格的下标归一化：负数从尾部计
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { len + index } else { index };
    (0..len).contains(&idx).then_some(idx as usize)
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live_entry(&self, key: &str) -> Option<StoredEntry> {
        let entry = self.data.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.data.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(entry.clone())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live_entry(key).map(|e| e.value) {
            None => Ok(None),
            Some(StoredValue::Str(s)) => Ok(Some(s)),
            Some(StoredValue::List(_)) => Err(wrong_type(key)),
        }
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.data.insert(
            key.to_string(),
            StoredEntry::new(StoredValue::Str(value.to_string()), ttl),
        );
    }

    pub fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        match self.data.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredEntry::new(StoredValue::Str(value.to_string()), ttl));
                    true
                } else {
                    false
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(StoredValue::Str(value.to_string()), ttl));
                true
            }
        }
    }

    pub fn del(&self, key: &str) {
        self.data.remove(key);
    }

    pub fn exists(&self, key: &str) -> bool {
        self.live_entry(key).is_some()
    }

    /// 不存在的键按 0 处理，保留原有过期时间
    pub fn decr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(StoredValue::Str("0".to_string()), None));
        if entry.is_expired() {
            *entry = StoredEntry::new(StoredValue::Str("0".to_string()), None);
        }
        let StoredValue::Str(current) = &entry.value else {
            return Err(wrong_type(key));
        };
        let current: i64 = current
            .parse()
            .map_err(|_| ProxyError::cache(format!("value of {key} is not an integer")))?;
        let next = current - delta;
        entry.value = StoredValue::Str(next.to_string());
        Ok(next)
    }

    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        match self.data.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        }
    }

    pub fn llen(&self, key: &str) -> Result<i64> {
        match self.live_entry(key).map(|e| e.value) {
            None => Ok(0),
            Some(StoredValue::List(list)) => Ok(list.len() as i64),
            Some(StoredValue::Str(_)) => Err(wrong_type(key)),
        }
    }

    pub fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(StoredValue::List(VecDeque::new()), None));
        if entry.is_expired() {
            *entry = StoredEntry::new(StoredValue::List(VecDeque::new()), None);
        }
        match &mut entry.value {
            StoredValue::List(list) => {
                list.push_front(value.to_string());
                Ok(list.len() as i64)
            }
            StoredValue::Str(_) => Err(wrong_type(key)),
        }
    }

    pub fn lindex(&self, key: &str, index: i64) -> Result<Option<String>> {
        match self.live_entry(key).map(|e| e.value) {
            None => Ok(None),
            Some(StoredValue::List(list)) => {
                Ok(normalize_index(index, list.len()).and_then(|i| list.get(i).cloned()))
            }
            Some(StoredValue::Str(_)) => Err(wrong_type(key)),
        }
    }

    /// 只保留 `[start, stop]` 闭区间
    pub fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let Some(mut entry) = self.data.get_mut(key) else {
            return Ok(());
        };
        let StoredValue::List(list) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            list.clear();
        } else {
            list.truncate((stop + 1) as usize);
            list.drain(..start as usize);
        }
        let emptied = list.is_empty();
        drop(entry);
        if emptied {
            self.data.remove(key);
        }
        Ok(())
    }

    /// 清理过期条目
    pub fn purge_expired(&self) -> usize {
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired());
        before - self.data.len()
    }
}

/// Redis 存储
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisStore {
    /// 建立连接并 PING
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ProxyError::cache_with_source("创建Redis客户端失败", e))?;
        let manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|e| ProxyError::cache_with_source("连接Redis超时", e))??;
        let store = Self { manager };
        store.ping().await?;
        Ok(store)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    pub async fn decr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("DECRBY").arg(key).arg(delta).query_async(&mut conn).await?)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let updated: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    pub async fn llen(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("LLEN").arg(key).query_async(&mut conn).await?)
    }

    pub async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("LPUSH").arg(key).arg(value).query_async(&mut conn).await?)
    }

    pub async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("LINDEX").arg(key).arg(index).query_async(&mut conn).await?)
    }

    pub async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// 键值存储枚举分发
#[derive(Debug)]
pub enum KvStore {
    Memory(MemoryStore),
    Redis(RedisStore),
}

impl KvStore {
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    /// 清理内存后端的过期键；Redis 自行过期
    pub fn purge_expired(&self) -> usize {
        match self {
            Self::Memory(store) => store.purge_expired(),
            Self::Redis(_) => 0,
        }
    }

    /// 是否为多实例共享的存储
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self, Self::Redis(_))
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redis(_) => "redis",
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            Self::Memory(store) => store.get(key),
            Self::Redis(store) => store.get(key).await,
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        match self {
            Self::Memory(store) => {
                store.set(key, value, ttl);
                Ok(())
            }
            Self::Redis(store) => store.set(key, value, ttl).await,
        }
    }

    /// 仅在键不存在时写入，返回是否写入成功
    pub async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        match self {
            Self::Memory(store) => Ok(store.set_nx(key, value, ttl)),
            Self::Redis(store) => store.set_nx(key, value, ttl).await,
        }
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        match self {
            Self::Memory(store) => {
                store.del(key);
                Ok(())
            }
            Self::Redis(store) => store.del(key).await,
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            Self::Memory(store) => Ok(store.exists(key)),
            Self::Redis(store) => store.exists(key).await,
        }
    }

    pub async fn decr_by(&self, key: &str, delta: i64) -> Result<i64> {
        match self {
            Self::Memory(store) => store.decr_by(key, delta),
            Self::Redis(store) => store.decr_by(key, delta).await,
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        match self {
            Self::Memory(store) => Ok(store.expire(key, ttl)),
            Self::Redis(store) => store.expire(key, ttl).await,
        }
    }

    pub async fn llen(&self, key: &str) -> Result<i64> {
        match self {
            Self::Memory(store) => store.llen(key),
            Self::Redis(store) => store.llen(key).await,
        }
    }

    pub async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        match self {
            Self::Memory(store) => store.lpush(key, value),
            Self::Redis(store) => store.lpush(key, value).await,
        }
    }

    pub async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>> {
        match self {
            Self::Memory(store) => store.lindex(key, index),
            Self::Redis(store) => store.lindex(key, index).await,
        }
    }

    pub async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        match self {
            Self::Memory(store) => store.ltrim(key, start, stop),
            Self::Redis(store) => store.ltrim(key, start, stop).await,
        }
    }

    /// 读取并反序列化 JSON 值
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ProxyError::cache_with_source(format!("反序列化缓存值失败: {key}"), e)),
            None => Ok(None),
        }
    }

    /// 序列化为 JSON 后写入
    pub async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)
            .map_err(|e| ProxyError::cache_with_source("序列化缓存值失败", e))?;
        self.set(key, &raw, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let store = KvStore::memory();
        assert!(store.set_nx("lock", "1", Some(Duration::from_secs(10))).await.unwrap());
        assert!(!store.set_nx("lock", "2", Some(Duration::from_secs(10))).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("1"));
        store.del("lock").await.unwrap();
        assert!(store.set_nx("lock", "3", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entries_disappear() {
        let store = KvStore::memory();
        store.set("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.set_nx("k", "again", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_decr_by_keeps_going_negative() {
        let store = KvStore::memory();
        store.set("user_quota:1", "100", None).await.unwrap();
        assert_eq!(store.decr_by("user_quota:1", 30).await.unwrap(), 70);
        assert_eq!(store.decr_by("user_quota:1", 100).await.unwrap(), -30);
        assert_eq!(store.decr_by("fresh", 5).await.unwrap(), -5);
    }

    #[tokio::test]
    async fn test_list_operations_follow_redis_semantics() {
        let store = KvStore::memory();
        for v in ["a", "b", "c", "d"] {
            store.lpush("list", v).await.unwrap();
        }
        // 头部为最新写入
        assert_eq!(store.lindex("list", 0).await.unwrap().as_deref(), Some("d"));
        assert_eq!(store.lindex("list", -1).await.unwrap().as_deref(), Some("a"));
        store.ltrim("list", 0, 1).await.unwrap();
        assert_eq!(store.llen("list").await.unwrap(), 2);
        assert_eq!(store.lindex("list", -1).await.unwrap().as_deref(), Some("c"));
        assert!(store.get("list").await.is_err());
    }
}
