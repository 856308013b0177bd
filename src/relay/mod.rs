//! # 中继
//!
//! 从选定渠道到上游再回到客户端的完整链路：请求体缓存、模式识别、
//! 渠道分配、适配器往返、重试与计费

pub mod adaptor;
pub mod body;
pub mod client;
pub mod controller;
pub mod dispatch;
pub mod distributor;
pub mod meta;
pub mod mode;
pub mod model;
pub mod ratio;
pub mod response;
pub mod sse;
pub mod thinking;
pub mod tokenizer;
pub mod tools;

pub use dispatch::relay;
pub use distributor::distribute;
pub use meta::RelayMeta;
pub use mode::RelayMode;
