//! 令牌表

use entity::{Tokens, tokens};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter};

use super::{Repository, non_negative};
use crate::error::Result;

impl Repository {
    pub async fn token_by_key(&self, key: &str) -> Result<Option<tokens::Model>> {
        Ok(Tokens::find()
            .filter(tokens::Column::Key.eq(key))
            .one(self.connection())
            .await?)
    }

    pub async fn token_by_id(&self, id: i32) -> Result<Option<tokens::Model>> {
        Ok(Tokens::find_by_id(id).one(self.connection()).await?)
    }

    pub async fn tokens_with_status(&self, status: i32) -> Result<Vec<tokens::Model>> {
        Ok(Tokens::find()
            .filter(tokens::Column::Status.eq(status))
            .all(self.connection())
            .await?)
    }

    pub async fn insert_token(&self, token: tokens::ActiveModel) -> Result<tokens::Model> {
        Ok(token.insert(self.connection()).await?)
    }

    pub async fn update_token_status(&self, id: i32, status: i32) -> Result<()> {
        Tokens::update_many()
            .col_expr(tokens::Column::Status, Expr::value(status))
            .filter(tokens::Column::Id.eq(id))
            .exec(self.connection())
            .await?;
        Ok(())
    }

    /// 写入提醒标记，`None` 表示不变
    pub async fn update_token_alerts(
        &self,
        id: i32,
        expired_alert: Option<i32>,
        exhausted_alert: Option<i32>,
    ) -> Result<()> {
        let mut update = Tokens::update_many().filter(tokens::Column::Id.eq(id));
        if let Some(flag) = expired_alert {
            update = update.col_expr(tokens::Column::ExpiredAlert, Expr::value(flag));
        }
        if let Some(flag) = exhausted_alert {
            update = update.col_expr(tokens::Column::ExhaustedAlert, Expr::value(flag));
        }
        update.exec(self.connection()).await?;
        Ok(())
    }

    /// 剩余额度 +q，已用额度 -q
    pub async fn increase_token_quota(&self, id: i32, quota: i64) -> Result<()> {
        non_negative(quota)?;
        self.shift_token_quota(id, quota).await
    }

    /// 剩余额度 -q，已用额度 +q
    pub async fn decrease_token_quota(&self, id: i32, quota: i64) -> Result<()> {
        non_negative(quota)?;
        self.shift_token_quota(id, -quota).await
    }

    pub(crate) async fn shift_token_quota(&self, id: i32, delta: i64) -> Result<()> {
        Tokens::update_many()
            .col_expr(
                tokens::Column::RemainQuota,
                Expr::col(tokens::Column::RemainQuota).add(delta),
            )
            .col_expr(
                tokens::Column::UsedQuota,
                Expr::col(tokens::Column::UsedQuota).sub(delta),
            )
            .col_expr(
                tokens::Column::AccessedTime,
                Expr::value(chrono::Utc::now().timestamp()),
            )
            .filter(tokens::Column::Id.eq(id))
            .exec(self.connection())
            .await?;
        Ok(())
    }
}
