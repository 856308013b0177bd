//! # 测试装配

use std::sync::Arc;

use entity::{channels, tokens, users};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

use super::fixtures::{self, ChannelRow};
use crate::app::AppContext;
use crate::auth::TokenStatus;
use crate::billing::{LogNotifier, Notifier};
use crate::cache::KvStore;
use crate::config::AppConfig;
use crate::database::run_migrations;
use crate::repository::Repository;

/// 单连接的内存 SQLite，已完成迁移
pub async fn memory_database() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(options)
        .await
        .expect("connect in-memory sqlite");
    run_migrations(&db).await.expect("run migrations");
    db
}

pub async fn memory_repository() -> Repository {
    Repository::new(Arc::new(memory_database().await))
}

/// 内存数据库 + 内存 KV 上的完整上下文
pub struct TestHarness {
    pub context: AppContext,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_notifier(Arc::new(LogNotifier::new())).await
    }

    pub async fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        Self::with_config(AppConfig::default(), notifier).await
    }

    pub async fn with_config(config: AppConfig, notifier: Arc<dyn Notifier>) -> Self {
        let db = memory_database().await;
        let context = AppContext::build(config, db, KvStore::memory(), notifier)
            .expect("build app context");
        Self { context }
    }

    pub async fn seed_user(&self, username: &str, group: &str, quota: i64) -> users::Model {
        self.context
            .repo
            .insert_user(fixtures::user_row(username, group, quota))
            .await
            .expect("insert user")
    }

    pub async fn seed_admin(&self, username: &str, group: &str, quota: i64) -> users::Model {
        let mut row = fixtures::user_row(username, group, quota);
        row.role = sea_orm::Set(crate::repository::ROLE_ADMIN);
        self.context.repo.insert_user(row).await.expect("insert admin")
    }

    pub async fn seed_token(&self, user_id: i32, key: &str, remain_quota: i64) -> tokens::Model {
        self.context
            .repo
            .insert_token(fixtures::token_row(user_id, key, remain_quota))
            .await
            .expect("insert token")
    }

    /// 令牌过期时间设为过去
    pub async fn expire_token(&self, token_id: i32) {
        use sea_orm::{ActiveModelTrait, Set};
        let token = self
            .context
            .repo
            .token_by_id(token_id)
            .await
            .expect("load token")
            .expect("token exists");
        let mut active: tokens::ActiveModel = token.into();
        active.expired_time = Set(chrono::Utc::now().timestamp() - 60);
        active.status = Set(TokenStatus::Enabled.code());
        active
            .update(self.context.repo.connection())
            .await
            .expect("expire token");
    }

    /// 写入渠道及其能力行，并重建索引
    pub async fn seed_channel(&self, row: ChannelRow) -> channels::Model {
        let channel = self
            .context
            .repo
            .insert_channel(row.active_model())
            .await
            .expect("insert channel");
        self.context.channels.rebuild().await.expect("rebuild index");
        channel
    }
}
