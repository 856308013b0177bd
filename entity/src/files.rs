//! # 上传媒体文件实体定义

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub model: String,
    /// 规范化 URL（原始 URL 或 data URL 内容的 md5）
    pub url: String,
    /// 服务商返回的文件 URI
    pub file_id: String,
    pub mime_type: String,
    pub created_time: i64,
    pub expired_time: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
