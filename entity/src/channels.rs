//! # 渠道实体定义
//!
//! 上游服务商渠道表的 Sea-ORM 实体模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 上游渠道实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub channel_type: i32,
    pub key: String,
    pub status: i32,
    pub name: String,
    pub weight: i32,
    pub created_time: i64,
    pub test_time: i64,
    pub response_time: i32,
    pub base_url: Option<String>,
    /// 逗号分隔的模型列表
    pub models: String,
    /// 逗号分隔的分组列表
    pub group: String,
    pub used_quota: i64,
    /// JSON: 模型名 -> 上游模型名
    pub model_mapping: Option<String>,
    pub priority: i64,
    /// JSON 配置包
    pub config: String,
    pub system_prompt: Option<String>,
    pub soft_limit_usd: f64,
    pub rpm_limit: i32,
    pub dpm_limit: i32,
    pub tpm_limit: i32,
    pub disable_reason: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::abilities::Entity")]
    Abilities,
}

impl Related<super::abilities::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Abilities.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
