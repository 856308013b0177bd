//! 媒体文件表

use entity::{Files, files};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};

use super::Repository;
use crate::error::Result;

/// 文件有效期（秒）
pub const FILE_TTL_SECS: i64 = 2 * 24 * 3600;

impl Repository {
    /// 按 (模型, 规范化 URL) 查询未过期文件
    pub async fn file_by_model_url(&self, model: &str, url: &str) -> Result<Option<files::Model>> {
        Ok(Files::find()
            .filter(files::Column::Model.eq(model))
            .filter(files::Column::Url.eq(url))
            .filter(files::Column::ExpiredTime.gt(chrono::Utc::now().timestamp()))
            .order_by_desc(files::Column::Id)
            .one(self.connection())
            .await?)
    }

    pub async fn insert_file(
        &self,
        model: &str,
        url: &str,
        file_id: &str,
        mime_type: &str,
    ) -> Result<files::Model> {
        let now = chrono::Utc::now().timestamp();
        let row = files::ActiveModel {
            model: Set(model.to_string()),
            url: Set(url.to_string()),
            file_id: Set(file_id.to_string()),
            mime_type: Set(mime_type.to_string()),
            created_time: Set(now),
            expired_time: Set(now + FILE_TTL_SECS),
            ..Default::default()
        };
        Ok(row.insert(self.connection()).await?)
    }

    pub async fn delete_file_by_file_id(&self, file_id: &str) -> Result<u64> {
        let result = Files::delete_many()
            .filter(files::Column::FileId.eq(file_id))
            .exec(self.connection())
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn delete_expired_files(&self, now: i64) -> Result<u64> {
        let result = Files::delete_many()
            .filter(files::Column::ExpiredTime.lte(now))
            .exec(self.connection())
            .await?;
        Ok(result.rows_affected)
    }
}
