//! # HTTP 服务
//!
//! 中继路由、账单路由、状态接口以及可选的诊断监听

mod diagnostics;
mod middleware;

pub use diagnostics::diagnostics_router;
pub use middleware::{REQUEST_ID_HEADER, RequestId, cache_body, recover, request_id};

use std::net::SocketAddr;

use axum::extract::{Request, State};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::app::AppContext;
use crate::auth::middleware::token_auth;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::rate_limit::middleware::{global_api_rate_limit, relay_rate_limit};
use crate::relay::controller::{subscription, usage, usage_detail};
use crate::relay::relay;
use crate::relay::response::not_found;
use crate::{linfo, lwarn};

const DIAGNOSTICS_ADDR: &str = "0.0.0.0:6060";

/// `/v1` 下的中继接口：先鉴权，再限流
fn relay_routes(ctx: &AppContext) -> Router<AppContext> {
    Router::new()
        .route("/v1/chat/completions", post(relay))
        .route("/v1/completions", post(relay))
        .route("/v1/embeddings", post(relay))
        .route("/v1/engines/{model}/embeddings", post(relay))
        .route("/v1/moderations", post(relay))
        .route("/v1/images/generations", post(relay))
        .route("/v1/images/edits", post(relay))
        .route("/v1/audio/speech", post(relay))
        .route("/v1/audio/transcriptions", post(relay))
        .route("/v1/audio/translations", post(relay))
        .route("/v1/videos/generations", post(relay))
        .route("/v1/proxy/{channel_id}", any(relay))
        .route("/v1/proxy/{channel_id}/{*path}", any(relay))
        .route_layer(from_fn_with_state(ctx.clone(), relay_rate_limit))
        .route_layer(from_fn_with_state(ctx.clone(), token_auth))
}

fn billing_routes(ctx: &AppContext) -> Router<AppContext> {
    let mut router = Router::new();
    for prefix in ["/v1/dashboard/billing", "/dashboard/billing"] {
        router = router
            .route(&format!("{prefix}/subscription"), get(subscription))
            .route(&format!("{prefix}/usage"), get(usage))
            .route(&format!("{prefix}/usage_detail"), get(usage_detail));
    }
    router.route_layer(from_fn_with_state(ctx.clone(), token_auth))
}

async fn status(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    let snapshot = ctx.channels.snapshot();
    Json(json!({
        "success": true,
        "message": "",
        "data": {
            "version": env!("CARGO_PKG_VERSION"),
            "kv": ctx.kv.kind(),
            "channels": snapshot.channels,
            "groups": snapshot.groups,
        }
    }))
}

async fn fallback(request: Request) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|rid| rid.0.clone())
        .unwrap_or_default();
    not_found(request.method().as_str(), request.uri().path())
        .with_request_id(&request_id)
        .into_response()
}

/// 主监听上的完整路由
pub fn build_router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/api/status", get(status))
        .route_layer(from_fn_with_state(ctx.clone(), global_api_rate_limit));

    Router::new()
        .merge(relay_routes(&ctx))
        .merge(billing_routes(&ctx))
        .merge(api)
        .fallback(fallback)
        .layer(axum::middleware::from_fn(recover))
        .layer(axum::middleware::from_fn(cache_body))
        .layer(axum::middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::server_init_with_source(format!("监听 {addr} 失败"), e))
}

/// 启动主监听（及诊断监听），直到 `shutdown` 被取消
pub async fn serve(ctx: AppContext, shutdown: CancellationToken) -> Result<()> {
    if ctx.config.server.pprof_debug {
        let listener = bind(DIAGNOSTICS_ADDR).await?;
        let router = diagnostics_router(ctx.clone());
        let token = shutdown.clone();
        linfo!("system", LogStage::Startup, LogComponent::Diagnostics, "diagnostics_start", "诊断接口已启动", addr = DIAGNOSTICS_ADDR);
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                lwarn!("system", LogStage::Shutdown, LogComponent::Diagnostics, "diagnostics_failed", "诊断接口异常退出", error = %e);
            }
        });
    }

    let addr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port);
    let listener = bind(&addr).await?;
    linfo!("system", LogStage::Startup, LogComponent::ServerSetup, "server_start", "中继服务已启动", addr = %addr);

    axum::serve(
        listener,
        build_router(ctx).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(|e| crate::error!(Network, format!("HTTP server error: {e}")))?;

    linfo!("system", LogStage::Shutdown, LogComponent::ServerSetup, "server_stopped", "中继服务已停止");
    Ok(())
}
