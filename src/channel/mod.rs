//! # 渠道模块
//!
//! 渠道运行时类型、索引选择器与休眠唤醒

mod store;
mod types;
mod wakeup;

pub use store::{ChannelIndex, ChannelStore, ChannelStoreSnapshot, SleepEntry};
pub use types::{Channel, ChannelConfig, ChannelKind, ChannelStatus};
pub use wakeup::{ChannelWakeupTask, WakeupCommand};
