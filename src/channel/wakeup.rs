//! # 渠道唤醒队列
//!
//! 以唤醒时间为键的延迟队列，到期即清除对应的休眠条目

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::time::{DelayQueue, delay_queue::Key};

use super::ChannelStore;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum WakeupCommand {
    Schedule {
        channel_id: i32,
        model: String,
        wake_at: i64,
    },
    Cancel {
        channel_id: i32,
        model: String,
    },
}

type SleepKey = (i32, String);

/// 渠道唤醒任务
#[derive(Clone)]
pub struct ChannelWakeupTask {
    store: Arc<ChannelStore>,
    command_sender: Arc<RwLock<Option<mpsc::Sender<WakeupCommand>>>>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl ChannelWakeupTask {
    #[must_use]
    pub fn new(store: Arc<ChannelStore>) -> Self {
        Self {
            store,
            command_sender: Arc::new(RwLock::new(None)),
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn start(&self) {
        if self.task_handle.read().await.is_some() {
            return;
        }
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task_handle = tokio::spawn(run(self.store.clone(), command_receiver));
        *self.command_sender.write().await = Some(command_sender);
        *self.task_handle.write().await = Some(task_handle);
    }

    pub async fn stop(&self) {
        let handle = self.task_handle.write().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        *self.command_sender.write().await = None;
        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::ChannelStore,
            "wakeup_task_stopped",
            "渠道唤醒任务已停止"
        );
    }

    pub async fn is_running(&self) -> bool {
        self.task_handle.read().await.is_some()
    }

    /// 登记唤醒时间；任务未运行时由周期性的全量唤醒兜底
    pub async fn schedule(&self, channel_id: i32, model: &str, wake_at: i64) -> Result<()> {
        self.send(WakeupCommand::Schedule {
            channel_id,
            model: model.to_string(),
            wake_at,
        })
        .await
    }

    pub async fn cancel(&self, channel_id: i32, model: &str) -> Result<()> {
        self.send(WakeupCommand::Cancel {
            channel_id,
            model: model.to_string(),
        })
        .await
    }

    async fn send(&self, command: WakeupCommand) -> Result<()> {
        if let Some(sender) = self.command_sender.read().await.as_ref() {
            sender
                .send(command)
                .await
                .map_err(|e| crate::error!(Internal, "发送唤醒命令失败", e))
        } else {
            Ok(())
        }
    }
}

async fn run(store: Arc<ChannelStore>, mut command_receiver: mpsc::Receiver<WakeupCommand>) {
    let mut queue: DelayQueue<SleepKey> = DelayQueue::new();
    let mut key_map: HashMap<SleepKey, Key> = HashMap::new();

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::ChannelStore,
        "wakeup_task_started",
        "渠道唤醒任务已启动"
    );

    loop {
        tokio::select! {
            Some(expired) = queue.next() => {
                let sleep_key = expired.into_inner();
                key_map.remove(&sleep_key);
                let (channel_id, model) = sleep_key;
                let woken = store.wake(channel_id, &model, chrono::Utc::now().timestamp());
                ldebug!("system", LogStage::BackgroundTask, LogComponent::ChannelStore, "channel_model_woken", "休眠到期", channel_id = channel_id, model = %model, woken = woken);
            }
            Some(command) = command_receiver.recv() => {
                handle_command(command, &mut queue, &mut key_map);
            }
            else => {
                break;
            }
        }
    }
}

fn handle_command(
    command: WakeupCommand,
    queue: &mut DelayQueue<SleepKey>,
    key_map: &mut HashMap<SleepKey, Key>,
) {
    match command {
        WakeupCommand::Schedule {
            channel_id,
            model,
            wake_at,
        } => {
            let now = chrono::Utc::now().timestamp();
            // 向上取整到秒边界，避免早于 wake_at 触发
            let delay = Duration::from_secs(u64::try_from(wake_at - now).unwrap_or(0))
                + Duration::from_millis(50);
            let sleep_key = (channel_id, model);
            if let Some(existing) = key_map.get(&sleep_key) {
                queue.reset(existing, delay);
            } else {
                let key = queue.insert(sleep_key.clone(), delay);
                key_map.insert(sleep_key, key);
            }
        }
        WakeupCommand::Cancel { channel_id, model } => {
            if let Some(key) = key_map.remove(&(channel_id, model)) {
                queue.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KvStore;
    use crate::channel::{ChannelIndex, ChannelKind};
    use crate::repository::Repository;
    use crate::testing::fixtures::channel;

    #[tokio::test]
    async fn test_scheduled_wakeup_clears_sleep() {
        let store = Arc::new(ChannelStore::new(
            Repository::new(Arc::new(sea_orm::DatabaseConnection::Disconnected)),
            Arc::new(KvStore::memory()),
        ));
        store.install(ChannelIndex::build(
            vec![channel(7, ChannelKind::Gemini, 0, &["gemini-pro"])],
            &[],
        ));
        let task = ChannelWakeupTask::new(store.clone());
        task.start().await;

        let wake_at = chrono::Utc::now().timestamp();
        store.sleep("default", "gemini-pro", 7, wake_at);
        task.schedule(7, "gemini-pro", wake_at).await.unwrap();

        for _ in 0..40 {
            if !store.is_sleeping(7, "gemini-pro") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!store.is_sleeping(7, "gemini-pro"));
        task.stop().await;
        assert!(!task.is_running().await);
    }
}
