use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub server_host: String,
    pub server_port: u16,
    pub environment: String,
    pub log_level: String,
    pub log_format: String,

    // Authentication configuration
    pub jwt_secret: String,
    pub jwt_expiry: i64,
    pub internal_api_token: String,

    // Blog service (user directory)
    pub blog_service_url: Option<String>,
    pub directory_cache_secs: u64,
    pub directory_timeout_ms: u64,

    // Key-value store configuration
    pub redis_url: Option<String>,
    pub kv_purge_interval: u64,

    // Notification history
    pub history_capacity: usize,
    pub default_history_limit: usize,
    pub comment_preview_chars: usize,

    // Event log
    pub node_id: Option<u16>,
    pub event_log_partitions: usize,
    pub event_log_retention: usize,
    pub publish_timeout_ms: u64,

    // Streaming
    pub subscriber_buffer: usize,
    pub sse_keepalive_secs: u64,
    pub stream_revalidate_secs: u64,

    // CORS configuration
    pub cors_allowed_origins: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3100".to_string())
                .parse()?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            log_level: env::var("LOG_LEVEL")
                .unwrap_or_else(|_| "rainbow_notify=debug,tower_http=debug".to_string()),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),

            jwt_secret: env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?,
            jwt_expiry: env::var("JWT_EXPIRY")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()?,
            internal_api_token: env::var("INTERNAL_API_TOKEN")
                .unwrap_or_else(|_| "default-token".to_string()),

            blog_service_url: env::var("BLOG_SERVICE_URL").ok().filter(|url| !url.is_empty()),
            directory_cache_secs: env::var("DIRECTORY_CACHE_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
            directory_timeout_ms: env::var("DIRECTORY_TIMEOUT_MS")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,

            redis_url: env::var("REDIS_URL").ok(),
            kv_purge_interval: env::var("KV_PURGE_INTERVAL")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,

            history_capacity: env::var("HISTORY_CAPACITY")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            default_history_limit: env::var("DEFAULT_HISTORY_LIMIT")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
            comment_preview_chars: env::var("COMMENT_PREVIEW_CHARS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,

            node_id: env::var("NODE_ID").ok().map(|id| id.parse::<u16>()).transpose()?,
            event_log_partitions: env::var("EVENT_LOG_PARTITIONS")
                .unwrap_or_else(|_| "8".to_string())
                .parse()?,
            event_log_retention: env::var("EVENT_LOG_RETENTION")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()?,
            publish_timeout_ms: env::var("PUBLISH_TIMEOUT_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()?,

            subscriber_buffer: env::var("SUBSCRIBER_BUFFER")
                .unwrap_or_else(|_| "64".to_string())
                .parse()?,
            sse_keepalive_secs: env::var("SSE_KEEPALIVE_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()?,
            stream_revalidate_secs: env::var("STREAM_REVALIDATE_SECS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()?,

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3001".to_string()),
        })
    }

    /// 测试与本地调试使用的固定配置
    pub fn for_tests() -> Self {
        Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            environment: "test".to_string(),
            log_level: "debug".to_string(),
            log_format: "pretty".to_string(),
            jwt_secret: "test-secret-that-is-long-enough-for-hs512-signing".to_string(),
            jwt_expiry: 3600,
            internal_api_token: "internal-test-token".to_string(),
            blog_service_url: None,
            directory_cache_secs: 300,
            directory_timeout_ms: 1000,
            redis_url: None,
            kv_purge_interval: 60,
            history_capacity: 100,
            default_history_limit: 20,
            comment_preview_chars: 30,
            node_id: None,
            event_log_partitions: 4,
            event_log_retention: 1000,
            publish_timeout_ms: 500,
            subscriber_buffer: 16,
            sse_keepalive_secs: 15,
            stream_revalidate_secs: 0,
            cors_allowed_origins: "http://localhost:3001".to_string(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
