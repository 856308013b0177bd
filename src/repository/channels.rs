//! 渠道与能力表

use entity::{Abilities, Channels, abilities, channels};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};

use super::Repository;
use crate::error::Result;

/// 拆分逗号分隔列表，去除空白与空项
#[must_use]
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn fan_out(channel: &channels::Model) -> Vec<abilities::ActiveModel> {
    let models = split_list(&channel.models);
    split_list(&channel.group)
        .into_iter()
        .flat_map(|group| {
            models.iter().map(move |model| abilities::ActiveModel {
                group: Set(group.clone()),
                model: Set(model.clone()),
                channel_id: Set(channel.id),
                enabled: Set(channel.status == crate::channel::ChannelStatus::Enabled.code()),
                priority: Set(channel.priority),
            })
        })
        .collect()
}

impl Repository {
    pub async fn all_channels(&self) -> Result<Vec<channels::Model>> {
        Ok(Channels::find()
            .order_by_asc(channels::Column::Id)
            .all(self.connection())
            .await?)
    }

    pub async fn channels_with_status(&self, status: i32) -> Result<Vec<channels::Model>> {
        Ok(Channels::find()
            .filter(channels::Column::Status.eq(status))
            .order_by_asc(channels::Column::Id)
            .all(self.connection())
            .await?)
    }

    pub async fn channel_by_id(&self, id: i32) -> Result<Option<channels::Model>> {
        Ok(Channels::find_by_id(id).one(self.connection()).await?)
    }

    pub async fn enabled_abilities(&self) -> Result<Vec<abilities::Model>> {
        Ok(Abilities::find()
            .filter(abilities::Column::Enabled.eq(true))
            .all(self.connection())
            .await?)
    }

    /// 写入渠道并展开能力行
    pub async fn insert_channel(&self, channel: channels::ActiveModel) -> Result<channels::Model> {
        let txn = self.connection().begin().await?;
        let saved = channel.insert(&txn).await?;
        let rows = fan_out(&saved);
        if !rows.is_empty() {
            Abilities::insert_many(rows).exec_without_returning(&txn).await?;
        }
        txn.commit().await?;
        Ok(saved)
    }

    /// 按渠道当前的分组与模型重建能力行
    pub async fn rebuild_channel_abilities(&self, channel: &channels::Model) -> Result<()> {
        let txn = self.connection().begin().await?;
        Abilities::delete_many()
            .filter(abilities::Column::ChannelId.eq(channel.id))
            .exec(&txn)
            .await?;
        let rows = fan_out(channel);
        if !rows.is_empty() {
            Abilities::insert_many(rows).exec_without_returning(&txn).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// 更新渠道状态，同步能力行的启用标记
    pub async fn update_channel_status(
        &self,
        id: i32,
        status: i32,
        reason: Option<&str>,
    ) -> Result<()> {
        let txn = self.connection().begin().await?;
        Channels::update_many()
            .col_expr(channels::Column::Status, Expr::value(status))
            .col_expr(
                channels::Column::DisableReason,
                Expr::value(reason.map(str::to_string)),
            )
            .filter(channels::Column::Id.eq(id))
            .exec(&txn)
            .await?;
        Abilities::update_many()
            .col_expr(
                abilities::Column::Enabled,
                Expr::value(status == crate::channel::ChannelStatus::Enabled.code()),
            )
            .filter(abilities::Column::ChannelId.eq(id))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn update_channel_used_quota(&self, id: i32, quota: i64) -> Result<()> {
        Channels::update_many()
            .col_expr(
                channels::Column::UsedQuota,
                Expr::col(channels::Column::UsedQuota).add(quota),
            )
            .filter(channels::Column::Id.eq(id))
            .exec(self.connection())
            .await?;
        Ok(())
    }
}
