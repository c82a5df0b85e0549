use crate::{
    config::Config,
    error::Result,
    models::notification::{NotificationIdGenerator, MAX_ID_NODES},
    services::{
        directory::{HttpUserDirectory, SharedDirectory},
        event_log::{MemoryEventLog, SharedLog},
        gateway::StreamGateway,
        history::RecentHistoryStore,
        hub::NotificationHub,
        kv::{MemoryStore, SharedStore},
        notification::NotificationService,
        publisher::EventPublisher,
        read_state::ReadStateTracker,
        token::TokenAuthority,
        StaticUserDirectory,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const NODE_SEQUENCE_KEY: &str = "notifications:node-seq";

/// 应用程序的共享状态
/// 包含所有服务和配置的引用
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Config,

    /// 键值存储（令牌记录、历史、已读集合）
    pub store: SharedStore,

    /// 进程内存储的句柄，用于后台清扫；使用 Redis 时为 None
    pub memory_store: Option<MemoryStore>,

    /// 事件日志
    pub event_log: SharedLog,

    /// 博客主服务目录的句柄，用于后台清理缓存；未配置时为 None
    pub http_directory: Option<HttpUserDirectory>,

    pub token_authority: TokenAuthority,
    pub publisher: EventPublisher,
    pub hub: NotificationHub,
    pub history: RecentHistoryStore,
    pub read_state: ReadStateTracker,
    pub notification_service: NotificationService,
    pub gateway: StreamGateway,
}

impl AppState {
    /// 按配置选择存储后端并组装所有服务
    pub async fn build(config: Config) -> Result<Self> {
        let (store, memory_store, event_log) = Self::backends(&config).await?;
        let node = Self::resolve_node(&config, &store).await?;

        let http_directory = match &config.blog_service_url {
            Some(url) => {
                info!("Resolving users and post authors through {}", url);
                Some(HttpUserDirectory::new(url, &config)?)
            }
            None => {
                warn!("BLOG_SERVICE_URL is not set; notifications rely on the names and authors sent with each event");
                None
            }
        };
        let directory: SharedDirectory = match &http_directory {
            Some(directory) => Arc::new(directory.clone()),
            None => Arc::new(StaticUserDirectory::new()),
        };

        let mut state = Self::assemble(config, store, memory_store, event_log, directory, node)?;
        state.http_directory = http_directory;
        Ok(state)
    }

    /// 全部使用进程内后端，测试使用
    pub fn in_memory(config: Config, directory: SharedDirectory) -> Result<Self> {
        let memory = MemoryStore::new();
        let event_log: SharedLog = Arc::new(MemoryEventLog::new(
            config.event_log_partitions,
            config.event_log_retention,
        ));
        let node = config.node_id.unwrap_or(0);
        Self::assemble(config, Arc::new(memory.clone()), Some(memory), event_log, directory, node)
    }

    // 未显式配置 NODE_ID 时从共享存储领取实例号，保证各实例生成的通知ID互不冲突
    async fn resolve_node(config: &Config, store: &SharedStore) -> Result<u16> {
        if let Some(node) = config.node_id {
            if node >= MAX_ID_NODES {
                warn!("NODE_ID {} exceeds {} and will be wrapped", node, MAX_ID_NODES - 1);
            }
            return Ok(node % MAX_ID_NODES);
        }
        let sequence = store.incr(NODE_SEQUENCE_KEY).await?;
        let node = (sequence - 1).rem_euclid(i64::from(MAX_ID_NODES)) as u16;
        info!("Claimed notification id node {}", node);
        Ok(node)
    }

    #[cfg(feature = "redis-cache")]
    async fn backends(config: &Config) -> Result<(SharedStore, Option<MemoryStore>, SharedLog)> {
        use crate::services::{redis_log::RedisStreamLog, redis_store::RedisStore};

        if let Some(url) = &config.redis_url {
            let store = RedisStore::connect(url).await?;
            let log = RedisStreamLog::connect(url, config.event_log_partitions, config.event_log_retention).await?;
            info!("Using Redis for key-value store and event log");
            return Ok((Arc::new(store), None, Arc::new(log)));
        }
        Ok(Self::memory_backends(config))
    }

    #[cfg(not(feature = "redis-cache"))]
    async fn backends(config: &Config) -> Result<(SharedStore, Option<MemoryStore>, SharedLog)> {
        if config.redis_url.is_some() {
            warn!("REDIS_URL is set but the redis-cache feature is disabled; using in-memory backends");
        }
        Ok(Self::memory_backends(config))
    }

    fn memory_backends(config: &Config) -> (SharedStore, Option<MemoryStore>, SharedLog) {
        if config.is_production() {
            warn!("Running with in-memory backends; notifications will not survive a restart");
        }
        info!("Using in-memory key-value store and event log");
        let memory = MemoryStore::new();
        let log: SharedLog = Arc::new(MemoryEventLog::new(
            config.event_log_partitions,
            config.event_log_retention,
        ));
        (Arc::new(memory.clone()), Some(memory), log)
    }

    fn assemble(
        config: Config,
        store: SharedStore,
        memory_store: Option<MemoryStore>,
        event_log: SharedLog,
        directory: SharedDirectory,
        node: u16,
    ) -> Result<Self> {
        let token_authority = TokenAuthority::new(&config, store.clone())?;
        let read_state = ReadStateTracker::new(store.clone());
        let history = RecentHistoryStore::new(store.clone(), read_state.clone(), config.history_capacity);
        let hub = NotificationHub::new(history.clone(), config.subscriber_buffer);
        let publisher = EventPublisher::new(
            event_log.clone(),
            Duration::from_millis(config.publish_timeout_ms),
        );
        let notification_service = NotificationService::new(
            publisher.clone(),
            directory,
            Arc::new(NotificationIdGenerator::with_node(node)),
            &config,
        );
        let gateway = StreamGateway::new(token_authority.clone(), hub.clone(), &config);

        Ok(Self {
            config,
            store,
            memory_store,
            event_log,
            http_directory: None,
            token_authority,
            publisher,
            hub,
            history,
            read_state,
            notification_service,
            gateway,
        })
    }
}
