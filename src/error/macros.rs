//! # 错误处理宏

/// 快速构造 [`ProxyError`](crate::error::ProxyError)
///
/// `error!(Variant, message)` 或 `error!(Variant, message, source)`
#[macro_export]
macro_rules! error {
    ($variant:ident, $msg:expr) => {
        $crate::error::ProxyError::$variant {
            message: ::std::string::String::from($msg),
            source: None,
        }
    };
    ($variant:ident, $msg:expr, $source:expr) => {
        $crate::error::ProxyError::$variant {
            message: ::std::string::String::from($msg),
            source: Some(::anyhow::Error::from($source)),
        }
    };
}

/// 条件不成立时返回错误
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $variant:ident, $msg:expr) => {
        if !($cond) {
            return Err($crate::error!($variant, $msg));
        }
    };
}
