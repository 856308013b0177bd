//! # 渠道分配
//!
//! 指定渠道的请求直接读库；其余按分组与模型从索引中随机选取最高优先级

use std::sync::Arc;

use axum::http::StatusCode;

use crate::app::AppContext;
use crate::auth::AuthContext;
use crate::channel::{Channel, ChannelStatus};
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

/// 为本次请求选定首个渠道
pub async fn distribute(
    ctx: &AppContext,
    auth: &AuthContext,
    request_id: &str,
) -> Result<Arc<Channel>, RelayError> {
    if let Some(raw) = auth.specific_channel_id.as_deref() {
        return pinned_channel(ctx, raw, request_id).await;
    }

    let (group, model) = (auth.group.as_str(), auth.request_model.as_str());
    match ctx.channels.select(group, model, false) {
        Some(channel) => {
            ldebug!(
                request_id,
                LogStage::Scheduling,
                LogComponent::Selector,
                "channel_selected",
                "已选定渠道",
                channel_id = channel.id,
                group = group,
                model = model
            );
            Ok(channel)
        }
        None => {
            let message = format!("当前分组 {group} 下对于模型 {model} 无可用渠道");
            lwarn!(request_id, LogStage::Scheduling, LogComponent::Selector, "no_channel", &message);
            Err(RelayError::abort(StatusCode::SERVICE_UNAVAILABLE, message))
        }
    }
}

async fn pinned_channel(
    ctx: &AppContext,
    raw: &str,
    request_id: &str,
) -> Result<Arc<Channel>, RelayError> {
    let invalid = || RelayError::abort(StatusCode::BAD_REQUEST, "无效的渠道 Id");
    let id: i32 = raw.parse().map_err(|_| invalid())?;
    let row = ctx
        .repo
        .channel_by_id(id)
        .await
        .map_err(|e| RelayError::wrap(e, "get_channel_failed", StatusCode::INTERNAL_SERVER_ERROR))?
        .ok_or_else(invalid)?;
    if row.status != ChannelStatus::Enabled.code() {
        return Err(RelayError::abort(StatusCode::FORBIDDEN, "该渠道已被禁用"));
    }
    ldebug!(request_id, LogStage::Scheduling, LogComponent::Selector, "channel_pinned", "使用指定渠道", channel_id = id);
    Ok(Arc::new(Channel::from_model(row)))
}
