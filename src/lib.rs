pub mod asr;
pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod pool;
pub mod schedule;
pub mod transcript;
pub mod upload;
pub mod utils;
pub mod web;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use cache::{CacheGateway, MemoryCacheStore, SqliteCacheStore};
use config::Config;
use schedule::{EventSink, FanoutSink, NotificationSink, TaskManager, TaskProcessor, TaskScheduler, WebhookSink};
use upload::UploadSessionManager;
use web::ConnectionHub;

/// Everything the web layer and the dispatchers share.
pub struct AppContext {
    pub config: Config,
    pub task_manager: Arc<TaskManager>,
    pub uploads: Arc<UploadSessionManager>,
    pub hub: Arc<ConnectionHub>,
    /// In-process broadcast of every task notification.
    pub events: EventSink,
    pub cache: Arc<CacheGateway>,
}

impl AppContext {
    pub async fn new(config: Config, processor: Arc<dyn TaskProcessor>) -> Result<Self> {
        let merge_gap = config.transcription.merge_gap_seconds;
        let cache = if config.database.cache_enabled {
            ensure_sqlite_dir(&config.database.url)?;
            let store = SqliteCacheStore::new(&config.database.url).await?;
            info!("Result cache at {}", config.database.url);
            CacheGateway::new(Arc::new(store), true, merge_gap)
        } else {
            info!("Result cache disabled");
            CacheGateway::new(Arc::new(MemoryCacheStore::new()), false, merge_gap)
        };
        Ok(Self::with_cache(config, processor, Arc::new(cache)))
    }

    pub fn with_cache(config: Config, processor: Arc<dyn TaskProcessor>, cache: Arc<CacheGateway>) -> Self {
        let hub = Arc::new(ConnectionHub::new());
        let (events, _) = EventSink::new(256);
        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![hub.clone(), Arc::new(events.clone())];
        if let Some(url) = &config.notification.webhook_url {
            info!("Webhook notifications go to {}", url);
            sinks.push(Arc::new(WebhookSink::new(url.clone(), &config.notification)));
        }

        let task_manager = Arc::new(TaskManager::new(
            config.transcription.clone(),
            cache.clone(),
            processor,
            Arc::new(FanoutSink::new(sinks)),
        ));
        let uploads = Arc::new(UploadSessionManager::from_config(&config.transcription));

        Self {
            config,
            task_manager,
            uploads,
            hub,
            events,
            cache,
        }
    }

    pub fn scheduler(&self) -> TaskScheduler {
        TaskScheduler::new(
            self.task_manager.clone(),
            self.uploads.clone(),
            self.cache.clone(),
            Duration::from_secs(self.config.database.maintenance_interval_secs),
            self.config.database.max_cache_days,
        )
    }
}

fn ensure_sqlite_dir(url: &str) -> Result<()> {
    let Some(path) = url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}
