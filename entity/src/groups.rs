//! # 分组实体定义

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 租户分组：可用模型、按模型的价格倍率、激活渠道目标数
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "groups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub name: String,
    pub models: String,
    /// JSON: 模型名 -> 倍率
    pub ratio: String,
    pub group_ratio: f64,
    pub active_num: i32,
    pub status: i32,
    pub created_time: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
