//! # API Relay
//!
//! 多租户 OpenAI 兼容中继网关：鉴权、限流、渠道选择、协议转换、额度计费

pub mod app;
pub mod auth;
pub mod billing;
pub mod cache;
pub mod channel;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod rate_limit;
pub mod relay;
pub mod repository;
pub mod server;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ProxyError, Result};
