//! # 后台任务调度器
//!
//! 任务按注册顺序启动、逆序停止。启动中途失败会回滚已启动的任务；
//! 停止时单个任务出错不影响其余任务，最后返回第一个错误

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::app::tasks::TaskType;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror, linfo};

type Hook = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

fn hook<F, Fut>(action: F) -> Hook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(action()))
}

/// 一个可启停的后台任务
#[derive(Clone)]
pub struct ScheduledTask {
    task_type: TaskType,
    on_start: Hook,
    on_stop: Option<Hook>,
}

impl ScheduledTask {
    #[must_use]
    pub fn builder(task_type: TaskType) -> ScheduledTaskBuilder {
        ScheduledTaskBuilder {
            task_type,
            on_start: None,
            on_stop: None,
        }
    }

    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub(crate) async fn start(&self) -> Result<()> {
        ldebug!("system", LogStage::BackgroundTask, LogComponent::Tasks, "task_start", "启动后台任务", task = ?self.task_type);
        (self.on_start)().await
    }

    /// 没有停止逻辑的任务直接视为已停止
    pub(crate) async fn stop(&self) -> Result<()> {
        let Some(on_stop) = &self.on_stop else {
            return Ok(());
        };
        ldebug!("system", LogStage::Shutdown, LogComponent::Tasks, "task_stop", "停止后台任务", task = ?self.task_type);
        on_stop().await
    }
}

pub struct ScheduledTaskBuilder {
    task_type: TaskType,
    on_start: Option<Hook>,
    on_stop: Option<Hook>,
}

impl ScheduledTaskBuilder {
    #[must_use]
    pub fn on_start<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_start = Some(hook(action));
        self
    }

    #[must_use]
    pub fn on_stop<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_stop = Some(hook(action));
        self
    }

    pub fn build(self) -> Result<ScheduledTask> {
        let Some(on_start) = self.on_start else {
            return Err(crate::error!(
                Internal,
                format!("后台任务 {:?} 缺少启动逻辑", self.task_type)
            ));
        };
        Ok(ScheduledTask {
            task_type: self.task_type,
            on_start,
            on_stop: self.on_stop,
        })
    }
}

#[derive(Default)]
struct SchedulerState {
    registered: Vec<ScheduledTask>,
    /// 已启动任务在 `registered` 中的前缀长度
    started: usize,
}

/// 后台任务调度器
#[derive(Default)]
pub struct TaskScheduler {
    state: Mutex<SchedulerState>,
}

impl TaskScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_many(&self, tasks: Vec<ScheduledTask>) {
        self.state.lock().await.registered.extend(tasks);
    }

    pub async fn task_types(&self) -> Vec<TaskType> {
        self.state
            .lock()
            .await
            .registered
            .iter()
            .map(ScheduledTask::task_type)
            .collect()
    }

    /// 启动尚未启动的任务；任一失败时停止本轮已启动的任务并返回错误
    pub async fn start_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let first = state.started;
        for index in first..state.registered.len() {
            let task = state.registered[index].clone();
            if let Err(err) = task.start().await {
                lerror!("system", LogStage::BackgroundTask, LogComponent::Tasks, "task_start_failed", "后台任务启动失败，回滚已启动任务", task = ?task.task_type, error = %err);
                for started in state.registered[first..index].iter().rev() {
                    let _ = started.stop().await;
                }
                state.started = first;
                return Err(err);
            }
            state.started = index + 1;
        }
        linfo!("system", LogStage::Startup, LogComponent::Tasks, "tasks_started", "后台任务已全部启动", count = state.started);
        Ok(())
    }

    /// 逆序停止已启动的任务
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut first_error = None;
        for task in state.registered[..state.started].iter().rev() {
            if let Err(err) = task.stop().await {
                lerror!("system", LogStage::Shutdown, LogComponent::Tasks, "task_stop_failed", "后台任务停止失败", task = ?task.task_type, error = %err);
                first_error.get_or_insert(err);
            }
        }
        state.started = 0;
        first_error.map_or(Ok(()), Err)
    }
}
