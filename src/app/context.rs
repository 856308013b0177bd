//! # 应用上下文
//!
//! 所有处理器与后台任务共享的服务对象，启动时装配一次

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::auth::TokenValidator;
use crate::billing::{BatchUpdater, Notifier, QuotaAccountant, TokenSweeper};
use crate::cache::{KvStore, ModelCache};
use crate::channel::{ChannelStore, ChannelWakeupTask};
use crate::config::{AppConfig, RuntimeOptions, SharedOptions};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::monitor::ChannelMonitor;
use crate::rate_limit::RateLimiter;
use crate::relay::adaptor::{AdaptorDeps, AdaptorRegistry};
use crate::relay::client::{HttpClients, MediaFetcher};
use crate::repository::Repository;
use crate::{linfo, lwarn};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub options: Arc<SharedOptions>,
    pub kv: Arc<KvStore>,
    pub repo: Repository,
    pub model_cache: ModelCache,
    pub token_validator: TokenValidator,
    pub rate_limiter: Arc<RateLimiter>,
    pub channels: Arc<ChannelStore>,
    pub wakeup: ChannelWakeupTask,
    pub clients: Arc<HttpClients>,
    pub adaptors: Arc<AdaptorRegistry>,
    pub monitor: Arc<ChannelMonitor>,
    pub accountant: QuotaAccountant,
    pub sweeper: TokenSweeper,
    pub notifier: Arc<dyn Notifier>,
    pub batch: Option<Arc<BatchUpdater>>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("kv", &self.kv.kind())
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// 装配服务；不访问数据库
    pub fn build(
        config: AppConfig,
        db: DatabaseConnection,
        kv: KvStore,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let options = Arc::new(SharedOptions::new(RuntimeOptions::from_config(&config)));
        let kv = Arc::new(kv);
        let repo = Repository::new(Arc::new(db));

        let model_cache = ModelCache::new(kv.clone(), repo.clone(), options.clone());
        let token_validator = TokenValidator::new(model_cache.clone(), repo.clone(), kv.clone());
        let rate_limiter = Arc::new(RateLimiter::for_store(kv.clone(), &config.rate_limit));

        let channels = Arc::new(ChannelStore::new(repo.clone(), kv.clone()));
        let wakeup = ChannelWakeupTask::new(channels.clone());

        let clients = Arc::new(HttpClients::from_config(&config.relay)?);
        let adaptors = Arc::new(AdaptorRegistry::new(&AdaptorDeps {
            clients: clients.clone(),
            media: MediaFetcher::new(clients.clone(), kv.clone()),
            repo: repo.clone(),
        }));

        let batch = config
            .sync
            .batch_update_enabled
            .then(|| Arc::new(BatchUpdater::new(repo.clone())));
        let monitor = Arc::new(ChannelMonitor::new(
            channels.clone(),
            wakeup.clone(),
            repo.clone(),
            options.clone(),
            notifier.clone(),
        ));
        let accountant = QuotaAccountant::new(
            repo.clone(),
            model_cache.clone(),
            options.clone(),
            kv.clone(),
            notifier.clone(),
            batch.clone(),
        );
        let sweeper = TokenSweeper::new(repo.clone(), kv.clone(), options.clone(), notifier.clone());

        Ok(Self {
            config,
            options,
            kv,
            repo,
            model_cache,
            token_validator,
            rate_limiter,
            channels,
            wakeup,
            clients,
            adaptors,
            monitor,
            accountant,
            sweeper,
            notifier,
            batch,
        })
    }

    /// 叠加 `options` 表并重建渠道索引
    pub async fn load_state(&self) -> Result<()> {
        self.reload_options().await?;
        self.channels.rebuild().await?;
        Ok(())
    }

    /// 从 `options` 表重新生成选项快照
    pub async fn reload_options(&self) -> Result<()> {
        let rows = self.repo.list_options().await?;
        let mut options = RuntimeOptions::from_config(&self.config);
        let rejected = options.apply_rows(rows.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        for key in rejected {
            lwarn!("system", LogStage::Configuration, LogComponent::Options, "option_rejected", "选项值无法解析，保持默认", key = %key);
        }
        self.options.replace(options);
        linfo!("system", LogStage::Configuration, LogComponent::Options, "options_loaded", "运行时选项已加载", rows = rows.len());
        Ok(())
    }
}
