//! 用量日志表

use entity::{Logs, logs};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};

use super::Repository;
use crate::error::Result;

/// 日志类型：消费
pub const LOG_TYPE_CONSUME: i32 = 2;

/// 一条待写入的用量日志
#[derive(Debug, Clone, Default)]
pub struct UsageLogRecord {
    pub user_id: i32,
    pub channel_id: i32,
    pub token_id: i32,
    pub token_name: String,
    pub model_name: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub quota: i64,
    pub content: String,
    pub elapsed_ms: i64,
    pub first_response_ms: i64,
    pub is_stream: bool,
    pub request_id: String,
}

impl Repository {
    pub async fn record_consume_log(&self, record: UsageLogRecord) -> Result<logs::Model> {
        let row = logs::ActiveModel {
            user_id: Set(record.user_id),
            created_at: Set(chrono::Utc::now().timestamp()),
            log_type: Set(LOG_TYPE_CONSUME),
            content: Set(record.content),
            token_id: Set(record.token_id),
            token_name: Set(record.token_name),
            model_name: Set(record.model_name),
            quota: Set(record.quota),
            prompt_tokens: Set(record.prompt_tokens),
            completion_tokens: Set(record.completion_tokens),
            channel_id: Set(record.channel_id),
            elapsed_time: Set(record.elapsed_ms),
            first_response_time: Set(record.first_response_ms),
            is_stream: Set(record.is_stream),
            request_id: Set(record.request_id),
            ..Default::default()
        };
        Ok(row.insert(self.connection()).await?)
    }

    /// 某令牌在时间区间内的日志，按时间升序
    pub async fn logs_by_token(
        &self,
        token_id: i32,
        start: i64,
        end: i64,
    ) -> Result<Vec<logs::Model>> {
        Ok(Logs::find()
            .filter(logs::Column::TokenId.eq(token_id))
            .filter(logs::Column::CreatedAt.gte(start))
            .filter(logs::Column::CreatedAt.lte(end))
            .order_by_asc(logs::Column::CreatedAt)
            .all(self.connection())
            .await?)
    }

    pub async fn logs_by_user(&self, user_id: i32) -> Result<Vec<logs::Model>> {
        Ok(Logs::find()
            .filter(logs::Column::UserId.eq(user_id))
            .order_by_asc(logs::Column::Id)
            .all(self.connection())
            .await?)
    }
}
