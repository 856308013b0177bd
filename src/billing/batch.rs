//! # 批量更新
//!
//! 额度增量先在内存中按 (类型, ID) 聚合，由后台任务定期落库

use dashmap::DashMap;

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::repository::Repository;
use crate::{ldebug, lerror};

/// 聚合的增量类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    /// 令牌剩余额度（正数为增加）
    TokenQuota,
    /// 用户剩余额度（正数为增加）
    UserQuota,
    UserUsedQuota,
    RequestCount,
    ChannelUsedQuota,
}

/// 批量更新器
#[derive(Debug)]
pub struct BatchUpdater {
    pending: DashMap<(BatchKind, i32), i64>,
    repo: Repository,
}

impl BatchUpdater {
    #[must_use]
    pub fn new(repo: Repository) -> Self {
        Self {
            pending: DashMap::new(),
            repo,
        }
    }

    pub fn add(&self, kind: BatchKind, id: i32, delta: i64) {
        if delta == 0 {
            return;
        }
        *self.pending.entry((kind, id)).or_insert(0) += delta;
    }

    /// 尚未落库的增量
    #[must_use]
    pub fn pending(&self, kind: BatchKind, id: i32) -> i64 {
        self.pending.get(&(kind, id)).map_or(0, |v| *v)
    }

    /// 落库全部增量，返回写入的条目数；失败的条目放回队列
    pub async fn flush(&self) -> Result<usize> {
        let keys: Vec<(BatchKind, i32)> = self.pending.iter().map(|e| *e.key()).collect();
        let mut written = 0;
        let mut first_error = None;
        for key in keys {
            let Some((_, delta)) = self.pending.remove(&key) else {
                continue;
            };
            let (kind, id) = key;
            let result = match kind {
                BatchKind::TokenQuota => self.repo.shift_token_quota(id, delta).await,
                BatchKind::UserQuota => self.repo.shift_user_quota(id, delta).await,
                BatchKind::UserUsedQuota => {
                    self.repo
                        .update_user_used_quota_and_request_count(id, delta, 0)
                        .await
                }
                BatchKind::RequestCount => {
                    let count = i32::try_from(delta).unwrap_or(i32::MAX);
                    self.repo
                        .update_user_used_quota_and_request_count(id, 0, count)
                        .await
                }
                BatchKind::ChannelUsedQuota => self.repo.update_channel_used_quota(id, delta).await,
            };
            match result {
                Ok(()) => written += 1,
                Err(e) => {
                    lerror!(
                        "system",
                        LogStage::BackgroundTask,
                        LogComponent::Billing,
                        "batch_flush_failed",
                        "批量更新写入失败",
                        kind = ?kind,
                        id = id,
                        error = %e
                    );
                    self.add(kind, id, delta);
                    first_error.get_or_insert(e);
                }
            }
        }
        ldebug!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::Billing,
            "batch_flushed",
            "批量更新已落库",
            written = written
        );
        first_error.map_or(Ok(written), Err)
    }
}
