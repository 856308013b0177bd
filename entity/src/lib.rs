//! # Entity 模块
//!
//! 中继网关持久化表的 Sea-ORM 实体定义

pub mod abilities;
pub mod channels;
pub mod files;
pub mod groups;
pub mod logs;
pub mod options;
pub mod tokens;
pub mod users;

pub use abilities::Entity as Abilities;
pub use channels::Entity as Channels;
pub use files::Entity as Files;
pub use groups::Entity as Groups;
pub use logs::Entity as Logs;
pub use options::Entity as Options;
pub use tokens::Entity as Tokens;
pub use users::Entity as Users;

#[cfg(test)]
mod tests;
