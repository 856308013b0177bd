//! # 测试支撑
//!
//! 实体构造器、内存数据库以及装配完成的 [`AppContext`](crate::app::AppContext)，
//! 单元测试与 `tests/` 下的集成测试共用

pub mod fixtures;
pub mod helpers;

pub use helpers::{TestHarness, memory_database, memory_repository};
