//! # 渠道监控
//!
//! 上游失败的处理策略与渠道健康计数

mod maintenance;
pub mod policy;
pub mod service;

pub use policy::{should_del_file, should_disable, should_retry, should_sleep};
pub use service::{ChannelFailure, ChannelHealth, ChannelMonitor, FailureOutcome};
