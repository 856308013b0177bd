//! 用户表

use entity::{Users, users};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QuerySelect};

use super::{Repository, non_negative};
use crate::error::{ProxyError, Result};

/// 用户状态：启用
pub const USER_STATUS_ENABLED: i32 = 1;
/// 角色：管理员
pub const ROLE_ADMIN: i32 = 10;
/// 角色：超级管理员
pub const ROLE_ROOT: i32 = 100;

impl Repository {
    pub async fn user_by_id(&self, id: i32) -> Result<Option<users::Model>> {
        Ok(Users::find_by_id(id).one(self.connection()).await?)
    }

    async fn required_user(&self, id: i32) -> Result<users::Model> {
        self.user_by_id(id)
            .await?
            .ok_or_else(|| ProxyError::database(format!("user {id} not found")))
    }

    pub async fn insert_user(&self, user: users::ActiveModel) -> Result<users::Model> {
        Ok(user.insert(self.connection()).await?)
    }

    pub async fn user_quota(&self, id: i32) -> Result<i64> {
        Ok(self.required_user(id).await?.quota)
    }

    pub async fn user_group(&self, id: i32) -> Result<String> {
        Ok(self.required_user(id).await?.group)
    }

    pub async fn user_enabled(&self, id: i32) -> Result<bool> {
        Ok(self.required_user(id).await?.status == USER_STATUS_ENABLED)
    }

    pub async fn user_role(&self, id: i32) -> Result<i32> {
        Ok(self.required_user(id).await?.role)
    }

    /// 超级管理员的邮箱
    pub async fn root_user_email(&self) -> Result<Option<String>> {
        let email = Users::find()
            .filter(users::Column::Role.eq(ROLE_ROOT))
            .select_only()
            .column(users::Column::Email)
            .into_tuple::<Option<String>>()
            .one(self.connection())
            .await?;
        Ok(email.flatten())
    }

    pub async fn increase_user_quota(&self, id: i32, quota: i64) -> Result<()> {
        non_negative(quota)?;
        self.shift_user_quota(id, quota).await
    }

    pub async fn decrease_user_quota(&self, id: i32, quota: i64) -> Result<()> {
        non_negative(quota)?;
        self.shift_user_quota(id, -quota).await
    }

    pub(crate) async fn shift_user_quota(&self, id: i32, delta: i64) -> Result<()> {
        Users::update_many()
            .col_expr(users::Column::Quota, Expr::col(users::Column::Quota).add(delta))
            .filter(users::Column::Id.eq(id))
            .exec(self.connection())
            .await?;
        Ok(())
    }

    pub async fn update_user_used_quota_and_request_count(
        &self,
        id: i32,
        quota: i64,
        count: i32,
    ) -> Result<()> {
        Users::update_many()
            .col_expr(
                users::Column::UsedQuota,
                Expr::col(users::Column::UsedQuota).add(quota),
            )
            .col_expr(
                users::Column::RequestCount,
                Expr::col(users::Column::RequestCount).add(count),
            )
            .filter(users::Column::Id.eq(id))
            .exec(self.connection())
            .await?;
        Ok(())
    }
}
