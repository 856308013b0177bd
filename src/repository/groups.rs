//! 分组表

use entity::{Groups, groups};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter};

use super::{Repository, split_list};
use crate::error::Result;

impl Repository {
    pub async fn group_by_name(&self, name: &str) -> Result<Option<groups::Model>> {
        Ok(Groups::find()
            .filter(groups::Column::Name.eq(name))
            .one(self.connection())
            .await?)
    }

    pub async fn all_groups(&self) -> Result<Vec<groups::Model>> {
        Ok(Groups::find().all(self.connection()).await?)
    }

    /// 分组可用模型
    pub async fn group_models(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .group_by_name(name)
            .await?
            .map(|g| split_list(&g.models))
            .unwrap_or_default())
    }

    pub async fn insert_group(&self, group: groups::ActiveModel) -> Result<groups::Model> {
        Ok(group.insert(self.connection()).await?)
    }
}
