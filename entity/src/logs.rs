//! # 使用日志实体定义
//!
//! 每个请求一行，只追加

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub user_id: i32,
    pub created_at: i64,
    pub log_type: i32,
    pub content: String,
    pub token_id: i32,
    pub token_name: String,
    pub model_name: String,
    pub quota: i64,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub channel_id: i32,
    /// 毫秒
    pub elapsed_time: i64,
    /// 毫秒，非流式为 0
    pub first_response_time: i64,
    pub is_stream: bool,
    pub request_id: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
