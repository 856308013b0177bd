//! # 诊断接口
//!
//! 只在 `pprof_debug` 打开时监听，暴露渠道索引与运行时选项

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::app::AppContext;
use crate::channel::ChannelStoreSnapshot;
use crate::config::RuntimeOptions;
use crate::monitor::ChannelHealth;

#[derive(Debug, Serialize)]
struct ChannelReport {
    #[serde(flatten)]
    store: ChannelStoreSnapshot,
    health: Vec<ChannelHealthEntry>,
}

#[derive(Debug, Serialize)]
struct ChannelHealthEntry {
    channel_id: i32,
    #[serde(flatten)]
    health: ChannelHealth,
}

async fn channels(State(ctx): State<AppContext>) -> Json<ChannelReport> {
    let mut health: Vec<_> = ctx
        .monitor
        .snapshot()
        .into_iter()
        .map(|(channel_id, health)| ChannelHealthEntry { channel_id, health })
        .collect();
    health.sort_by_key(|entry| entry.channel_id);
    Json(ChannelReport {
        store: ctx.channels.snapshot(),
        health,
    })
}

async fn options(State(ctx): State<AppContext>) -> Json<RuntimeOptions> {
    Json(ctx.options.snapshot().as_ref().clone())
}

pub fn diagnostics_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/debug/channels", get(channels))
        .route("/debug/options", get(options))
        .with_state(ctx)
}
