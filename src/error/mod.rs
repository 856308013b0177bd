//! # 错误处理
//!
//! 内部错误统一为 [`ProxyError`]，面向客户端的中继错误为 [`RelayError`]

use std::fmt::Display;

pub use relay::{OpenAiError, RelayError};
pub use types::ProxyError;

/// 全局 `Result` 类型
pub type Result<T> = std::result::Result<T, ProxyError>;

pub mod macros;
pub mod relay;
pub mod types;

/// 为错误附加上下文
pub trait Context<T, E> {
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display;

    #[track_caller]
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<ProxyError>,
{
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display,
    {
        self.with_context(|| context)
    }

    #[track_caller]
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display,
    {
        self.map_err(|error| ProxyError::Context {
            context: context().to_string(),
            source: Box::new(error.into()),
        })
    }
}

/// 错误归属，用于日志分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 调用方造成（4xx）
    Client,
    /// 服务端或上游造成（5xx）
    Server,
}

#[cfg(test)]
mod tests;
