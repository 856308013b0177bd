//! # API Relay 主程序
//!
//! 加载配置、初始化存储、启动后台任务与 HTTP 服务

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use api_relay::{
    Result,
    app::{AppContext, AppTasks},
    billing::LogNotifier,
    cache::{KvStore, RedisStore},
    config::{self, AppConfig},
    database, lerror, linfo, lwarn,
    logging::{self, LogComponent, LogStage},
    server,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;

/// 多租户 OpenAI 兼容中继网关
#[derive(Debug, Parser)]
#[command(name = "api-relay", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(long)]
    config: Option<PathBuf>,
    /// 覆盖监听端口
    #[arg(long)]
    port: Option<u16>,
    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match config::load_config(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            config
        }
        Err(e) => {
            logging::init_optimized_logging(cli.log_level.as_ref());
            lerror!("system", LogStage::Startup, LogComponent::Config, "config_load_failed", "配置加载失败", error = %e);
            std::process::exit(1);
        }
    };
    let level = logging::level_for_mode(&config.server.mode, cli.log_level.as_ref());
    logging::init_optimized_logging(Some(&level));

    let (ctx, tasks) = match initialize(config).await {
        Ok(ready) => ready,
        Err(e) => {
            lerror!("system", LogStage::Startup, LogComponent::Main, "init_failed", "初始化失败", error = %e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    linfo!("system", LogStage::Startup, LogComponent::Main, "service_starting", "服务启动");
    let served = server::serve(ctx, shutdown).await;
    if let Err(e) = tasks.stop().await {
        lwarn!("system", LogStage::Shutdown, LogComponent::Tasks, "tasks_stop_failed", "后台任务停止失败", error = %e);
    }
    if let Err(e) = served {
        lerror!("system", LogStage::Shutdown, LogComponent::Main, "service_failed", "服务异常退出", error = %e);
        std::process::exit(1);
    }
    linfo!("system", LogStage::Shutdown, LogComponent::Main, "service_shutdown", "服务正常关闭");
}

async fn open_kv(config: &AppConfig) -> Result<KvStore> {
    match config.redis.url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => {
            let timeout = Duration::from_secs(config.redis.connect_timeout.max(1));
            let store = RedisStore::connect(url, timeout).await?;
            linfo!("system", LogStage::Startup, LogComponent::Cache, "redis_connected", "Redis 已连接");
            Ok(KvStore::Redis(store))
        }
        None => {
            linfo!("system", LogStage::Startup, LogComponent::Cache, "memory_kv", "未配置 Redis，使用进程内存储");
            Ok(KvStore::memory())
        }
    }
}

async fn initialize(config: AppConfig) -> Result<(AppContext, AppTasks)> {
    let db = database::init_database(&config.database).await?;
    database::run_migrations(&db).await?;

    let kv = open_kv(&config).await?;
    let ctx = AppContext::build(config, db, kv, Arc::new(LogNotifier::new()))?;
    ctx.load_state().await?;

    let tasks = AppTasks::initialize(&ctx).await?;
    tasks.start().await?;
    Ok((ctx, tasks))
}

async fn wait_for_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            linfo!("system", LogStage::Shutdown, LogComponent::Main, "shutdown_signal", "收到 Ctrl+C，开始关闭");
        }
        Err(e) => {
            lerror!("system", LogStage::Shutdown, LogComponent::Main, "signal_listen_failed", "监听关闭信号失败", error = %e);
            return;
        }
    }
    shutdown.cancel();
}
