//! # 数据库
//!
//! 连接池与迁移；SQLite 文件及其目录在连接前创建

use std::path::Path;
use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

use crate::config::DatabaseConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};

/// `sqlite:` URL 中的文件路径，内存库返回 `None`
fn sqlite_file_path(database_url: &str) -> Option<&str> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    (!path.is_empty() && path != ":memory:").then_some(path)
}

fn ensure_sqlite_file(db_path: &str) -> Result<()> {
    let file = Path::new(db_path);
    if let Some(dir) = file.parent().filter(|p| !p.as_os_str().is_empty() && !p.exists()) {
        ldebug!("system", LogStage::Startup, LogComponent::Database, "create_db_dir", "创建数据库目录", dir = %dir.display());
        std::fs::create_dir_all(dir).map_err(|e| {
            ProxyError::database_with_source(format!("无法创建数据库目录 {}", dir.display()), e)
        })?;
    }
    if !file.exists() {
        std::fs::File::create(file).map_err(|e| {
            ProxyError::database_with_source(format!("无法创建数据库文件 {db_path}"), e)
        })?;
    }
    Ok(())
}

fn connect_options(config: &DatabaseConfig) -> ConnectOptions {
    let mut options = ConnectOptions::new(config.url.clone());
    options
        .max_connections(config.max_open_conns.max(1))
        .min_connections(config.max_idle_conns.min(config.max_open_conns))
        .max_lifetime(Duration::from_secs(config.max_lifetime.max(1)))
        .sqlx_logging(false);
    options
}

/// 建立连接池
pub async fn init_database(config: &DatabaseConfig) -> Result<DatabaseConnection> {
    let shown: String = config.url.chars().take(50).collect();
    linfo!("system", LogStage::Startup, LogComponent::Database, "db_connect", "正在连接数据库", url = %shown);

    if let Some(db_path) = sqlite_file_path(&config.url) {
        ensure_sqlite_file(db_path)?;
    }
    let db = Database::connect(connect_options(config))
        .await
        .map_err(|e| ProxyError::database_with_source("连接数据库失败", e))?;
    linfo!("system", LogStage::Startup, LogComponent::Database, "db_connected", "数据库连接成功", max_open_conns = config.max_open_conns);
    Ok(db)
}

pub async fn run_migrations(db: &DatabaseConnection) -> Result<()> {
    ::migration::Migrator::up(db, None)
        .await
        .map_err(|e| ProxyError::database_with_source("数据库迁移失败", e))?;
    ldebug!("system", LogStage::Startup, LogComponent::Database, "db_migrated", "数据库迁移完成");
    Ok(())
}
