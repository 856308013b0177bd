//! # 后台任务
//!
//! 按配置注册的周期任务：渠道同步与唤醒、软限制、令牌巡检、批量落库、
//! 过期文件清理、渠道激活、选项同步、限流键清理

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::app::context::AppContext;
use crate::app::task_scheduler::{ScheduledTask, TaskScheduler};
use crate::config::AppConfig;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

/// 后台任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// 重建渠道索引
    ChannelSync,
    /// 唤醒到期的休眠渠道
    ChannelWakeup,
    /// 停用超出软限制的渠道
    SoftLimit,
    TokenAlert,
    /// 令牌过期/耗尽状态
    TokenStatus,
    BatchFlush,
    FileCleanup,
    /// 补足各分组的活跃渠道
    ChannelActivation,
    OptionsSync,
    RateLimitPurge,
}

/// 需要启动的任务及其周期
#[must_use]
pub fn task_plan(config: &AppConfig) -> Vec<(TaskType, Duration)> {
    let sync = &config.sync;
    let mut plan = Vec::new();
    let mut push = |task: TaskType, secs: Option<u64>| {
        if let Some(secs) = secs.filter(|s| *s > 0) {
            plan.push((task, Duration::from_secs(secs)));
        }
    };
    push(TaskType::ChannelSync, sync.channel_frequency);
    push(TaskType::ChannelWakeup, sync.channel_wakeup);
    push(TaskType::SoftLimit, sync.channel_softlimit);
    push(TaskType::TokenAlert, sync.token_alert);
    push(TaskType::TokenStatus, sync.token_update_frequency);
    push(
        TaskType::BatchFlush,
        sync.batch_update_enabled.then_some(sync.batch_update_interval),
    );
    push(TaskType::FileCleanup, Some(sync.frequency));
    push(
        TaskType::ChannelActivation,
        sync.auto_activate_channel.then_some(sync.auto_activate_interval),
    );
    push(TaskType::OptionsSync, sync.options_frequency);
    push(
        TaskType::RateLimitPurge,
        (!config.redis_enabled()).then_some(config.rate_limit.memory_expiration),
    );
    plan
}

async fn run_periodic<F, Fut>(
    task_type: TaskType,
    period: Duration,
    token: CancellationToken,
    job: Arc<F>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 首个 tick 立即返回，跳过以便先等待一个周期
    ticker.tick().await;
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = job().await {
                    lwarn!("system", LogStage::BackgroundTask, LogComponent::Tasks, "task_round_failed", "后台任务本轮执行失败", task = ?task_type, error = %e);
                }
            }
        }
    }
}

/// 周期执行 `job`；停止时取消循环
fn periodic<F, Fut>(
    task_type: TaskType,
    period: Duration,
    token: CancellationToken,
    job: F,
) -> Result<ScheduledTask>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let job = Arc::new(job);
    let stop_token = token.clone();
    ScheduledTask::builder(task_type)
        .on_start(move || {
            let job = job.clone();
            let token = token.clone();
            async move {
                tokio::spawn(run_periodic(task_type, period, token, job));
                Ok(())
            }
        })
        .on_stop(move || {
            let token = stop_token.clone();
            async move {
                token.cancel();
                Ok(())
            }
        })
        .build()
}

fn job_for(ctx: &AppContext, task_type: TaskType, period: Duration, token: CancellationToken) -> Result<ScheduledTask> {
    let ctx = ctx.clone();
    match task_type {
        TaskType::ChannelSync => periodic(task_type, period, token, move || {
            let ctx = ctx.clone();
            async move { ctx.channels.rebuild().await.map(drop) }
        }),
        TaskType::ChannelWakeup => {
            // 延迟队列负责准点唤醒，周期全量唤醒兜底
            let wakeup = ctx.wakeup.clone();
            let stopper = ctx.wakeup.clone();
            let sweep = periodic(task_type, period, token.clone(), move || {
                let ctx = ctx.clone();
                async move {
                    let woken = ctx.channels.wake_all(chrono::Utc::now().timestamp());
                    if woken > 0 {
                        ldebug!("system", LogStage::BackgroundTask, LogComponent::Tasks, "channels_woken", "已唤醒休眠渠道", count = woken);
                    }
                    Ok(())
                }
            })?;
            ScheduledTask::builder(task_type)
                .on_start(move || {
                    let wakeup = wakeup.clone();
                    let sweep = sweep.clone();
                    async move {
                        wakeup.start().await;
                        sweep.start().await
                    }
                })
                .on_stop(move || {
                    let wakeup = stopper.clone();
                    let token = token.clone();
                    async move {
                        token.cancel();
                        wakeup.stop().await;
                        Ok(())
                    }
                })
                .build()
        }
        TaskType::SoftLimit => periodic(task_type, period, token, move || {
            let ctx = ctx.clone();
            async move { ctx.monitor.close_soft_limit_channels().await.map(drop) }
        }),
        TaskType::TokenAlert => periodic(task_type, period, token, move || {
            let ctx = ctx.clone();
            async move { ctx.sweeper.send_alerts().await.map(drop) }
        }),
        TaskType::TokenStatus => periodic(task_type, period, token, move || {
            let ctx = ctx.clone();
            async move { ctx.sweeper.update_statuses().await.map(drop) }
        }),
        TaskType::BatchFlush => {
            let flush_ctx = ctx.clone();
            let flush = move || {
                let batch = flush_ctx.batch.clone();
                async move {
                    match batch {
                        Some(batch) => batch.flush().await.map(drop),
                        None => Ok(()),
                    }
                }
            };
            let final_flush = flush.clone();
            let sweep = periodic(task_type, period, token.clone(), flush)?;
            ScheduledTask::builder(task_type)
                .on_start(move || {
                    let sweep = sweep.clone();
                    async move { sweep.start().await }
                })
                .on_stop(move || {
                    let token = token.clone();
                    let final_flush = final_flush.clone();
                    async move {
                        token.cancel();
                        final_flush().await
                    }
                })
                .build()
        }
        TaskType::FileCleanup => periodic(task_type, period, token, move || {
            let ctx = ctx.clone();
            async move {
                ctx.repo
                    .delete_expired_files(chrono::Utc::now().timestamp())
                    .await
                    .map(drop)
            }
        }),
        TaskType::ChannelActivation => periodic(task_type, period, token, move || {
            let ctx = ctx.clone();
            async move { ctx.monitor.activate_channels().await.map(drop) }
        }),
        TaskType::OptionsSync => periodic(task_type, period, token, move || {
            let ctx = ctx.clone();
            async move { ctx.reload_options().await }
        }),
        TaskType::RateLimitPurge => periodic(task_type, period, token, move || {
            let ctx = ctx.clone();
            async move {
                purge_local_state(&ctx);
                Ok(())
            }
        }),
    }
}

/// 清理进程内限流窗口与 KV 中的过期键
fn purge_local_state(ctx: &AppContext) -> usize {
    let purged = ctx.rate_limiter.purge() + ctx.kv.purge_expired();
    if purged > 0 {
        ldebug!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::Tasks,
            "local_state_purged",
            "已清理过期的内存键",
            purged = purged
        );
    }
    purged
}

/// 后台任务集合
pub struct AppTasks {
    scheduler: Arc<TaskScheduler>,
    shutdown: CancellationToken,
}

impl AppTasks {
    /// 按配置注册全部后台任务，尚未启动
    pub async fn initialize(ctx: &AppContext) -> Result<Self> {
        let scheduler = Arc::new(TaskScheduler::new());
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        for (task_type, period) in task_plan(&ctx.config) {
            tasks.push(job_for(ctx, task_type, period, shutdown.child_token())?);
        }
        scheduler.register_many(tasks).await;
        Ok(Self { scheduler, shutdown })
    }

    #[must_use]
    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start_all().await
    }

    /// 停止全部任务；批量落库任务会在停止时做最后一次写入
    pub async fn stop(&self) -> Result<()> {
        let result = self.scheduler.shutdown().await;
        self.shutdown.cancel();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;
    use crate::billing::BatchKind;

    #[test]
    fn test_default_plan() {
        let plan: Vec<TaskType> = task_plan(&AppConfig::default())
            .into_iter()
            .map(|(task, _)| task)
            .collect();
        assert_eq!(
            plan,
            vec![TaskType::ChannelWakeup, TaskType::FileCleanup, TaskType::RateLimitPurge]
        );
    }

    #[test]
    fn test_full_plan_uses_configured_periods() {
        let mut config = AppConfig::default();
        config.sync.channel_frequency = Some(60);
        config.sync.channel_softlimit = Some(120);
        config.sync.token_alert = Some(300);
        config.sync.token_update_frequency = Some(30);
        config.sync.options_frequency = Some(15);
        config.sync.batch_update_enabled = true;
        config.sync.auto_activate_channel = true;
        let plan = task_plan(&config);
        assert_eq!(plan.len(), 10);
        assert!(plan.contains(&(TaskType::SoftLimit, Duration::from_secs(120))));
        assert!(plan.contains(&(TaskType::BatchFlush, Duration::from_secs(5))));
        assert!(plan.contains(&(TaskType::ChannelActivation, Duration::from_secs(10))));
    }

    #[tokio::test]
    async fn test_purge_drops_expired_kv_keys() {
        let harness = TestHarness::new().await;
        let ctx = &harness.context;
        ctx.kv
            .set("token:sk-short", "{}", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        ctx.kv.set("token:sk-long", "{}", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(purge_local_state(ctx), 1);
        assert!(ctx.kv.exists("token:sk-long").await.unwrap());
        assert_eq!(purge_local_state(ctx), 0);
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_batch() {
        let mut config = AppConfig::default();
        config.sync.batch_update_enabled = true;
        let harness = TestHarness::with_config(config, Arc::new(crate::billing::LogNotifier::new())).await;
        let ctx = &harness.context;
        let user = harness.seed_user("carol", "default", 1000).await;
        let token = harness.seed_token(user.id, "sk-batch", 1000).await;

        let tasks = AppTasks::initialize(ctx).await.unwrap();
        assert!(tasks.scheduler().task_types().await.contains(&TaskType::BatchFlush));
        tasks.start().await.unwrap();
        assert!(ctx.wakeup.is_running().await);

        let batch = ctx.batch.clone().unwrap();
        batch.add(BatchKind::TokenQuota, token.id, -100);
        tasks.stop().await.unwrap();

        assert_eq!(batch.pending(BatchKind::TokenQuota, token.id), 0);
        let row = ctx.repo.token_by_id(token.id).await.unwrap().unwrap();
        assert_eq!(row.remain_quota, 900);
        assert!(!ctx.wakeup.is_running().await);
    }
}
