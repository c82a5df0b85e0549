use crate::error::{AppError, Result};
use crate::services::kv::KeyValueStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

/// Redis 键值存储
///
/// `ConnectionManager` 负责断线重连，克隆代价很低，每次调用克隆一份即可。
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis at {}", redis_url);

        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::KeyValue(format!("Failed to create Redis client: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::KeyValue(format!("Failed to connect to Redis: {}", e)))?;

        info!("Successfully connected to Redis");
        Ok(Self { manager })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex::<_, _, ()>(key, value, millis).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn push_front_capped(&self, key: &str, value: &str, cap: usize) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let cap = isize::try_from(cap).unwrap_or(isize::MAX);
        // MULTI 内先取出将被截掉的部分再截断
        let (evicted,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lpush(key, value)
            .ignore()
            .lrange(key, cap, -1)
            .ltrim(key, 0, cap - 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(evicted)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        Ok(conn.lrange::<_, Vec<String>>(key, 0, -1).await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection();
        Ok(conn.sismember::<_, _, bool>(key, member).await?)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        Ok(conn.smembers::<_, Vec<String>>(key).await?)
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection();
        Ok(conn.srem::<_, _, usize>(key, members).await?)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection();
        Ok(conn.incr::<_, _, i64>(key, 1).await?)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
