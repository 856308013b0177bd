//! # 应用装配
//!
//! 共享上下文与后台任务

pub mod context;
pub mod task_scheduler;
pub mod tasks;

pub use context::AppContext;
pub use task_scheduler::{ScheduledTask, TaskScheduler};
pub use tasks::{AppTasks, TaskType, task_plan};
