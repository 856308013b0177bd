//! # 持久化访问层
//!
//! 基于 Sea-ORM 的类型化数据库操作，按表拆分

mod channels;
mod files;
mod groups;
mod logs;
mod options;
mod tokens;
mod users;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

pub use channels::split_list;
pub use files::FILE_TTL_SECS;
pub use logs::{LOG_TYPE_CONSUME, UsageLogRecord};
pub use users::{ROLE_ADMIN, ROLE_ROOT, USER_STATUS_ENABLED};

/// 数据库仓储
#[derive(Debug, Clone)]
pub struct Repository {
    db: Arc<DatabaseConnection>,
}

impl Repository {
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }
}

/// 额度变更量不得为负
fn non_negative(quota: i64) -> crate::error::Result<()> {
    crate::ensure!(quota >= 0, Validation, "quota 不能为负数！");
    Ok(())
}

#[cfg(test)]
mod tests;
