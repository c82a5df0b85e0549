use crate::{
    error::{AppError, Result},
    models::notification::NotificationEvent,
    services::event_log::{partition_for, EventLog, LogConsumer, LogPosition, LogRecord},
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

const STREAM_PREFIX: &str = "notifications:log:";
const PAYLOAD_FIELD: &str = "payload";
const READ_BLOCK_MS: usize = 2000;
const READ_BATCH: usize = 256;

/// 基于 Redis Stream 的持久化事件日志，每个分区一个 stream
#[derive(Clone)]
pub struct RedisStreamLog {
    client: redis::Client,
    manager: ConnectionManager,
    partitions: usize,
    retention: usize,
}

impl RedisStreamLog {
    pub async fn connect(redis_url: &str, partitions: usize, retention: usize) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::EventLog(format!("Failed to create Redis client: {}", e)))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| AppError::EventLog(format!("Failed to connect to Redis: {}", e)))?;

        info!("Redis stream event log ready with {} partitions", partitions.max(1));
        Ok(Self {
            client,
            manager,
            partitions: partitions.max(1),
            retention: retention.max(1),
        })
    }

    fn stream_key(partition: usize) -> String {
        format!("{}{}", STREAM_PREFIX, partition)
    }
}

#[async_trait]
impl EventLog for RedisStreamLog {
    async fn append(&self, event: &NotificationEvent) -> Result<LogPosition> {
        let partition = partition_for(&event.recipient_id, self.partitions);
        let payload = serde_json::to_string(event)?;
        let mut conn = self.manager.clone();

        let id: String = conn
            .xadd_maxlen(
                Self::stream_key(partition),
                StreamMaxlen::Approx(self.retention),
                "*",
                &[(PAYLOAD_FIELD, payload)],
            )
            .await
            .map_err(|e| AppError::EventLog(e.to_string()))?;

        debug!("Appended notification {} to stream partition {} as {}", event.id, partition, id);
        Ok(LogPosition { partition, offset: id })
    }

    async fn consumer(&self) -> Result<Box<dyn LogConsumer>> {
        // 阻塞读取会占住连接，消费者使用独立连接
        let mut conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| AppError::EventLog(e.to_string()))?;

        let mut keys = Vec::with_capacity(self.partitions);
        let mut cursors = Vec::with_capacity(self.partitions);
        for partition in 0..self.partitions {
            let key = Self::stream_key(partition);
            let tail: StreamRangeReply = conn
                .xrevrange_count(&key, "+", "-", 1)
                .await
                .map_err(|e| AppError::EventLog(e.to_string()))?;
            cursors.push(tail.ids.first().map_or_else(|| "0-0".to_string(), |id| id.id.clone()));
            keys.push(key);
        }

        Ok(Box::new(RedisStreamConsumer { conn, keys, cursors }))
    }

    fn partitions(&self) -> usize {
        self.partitions
    }
}

struct RedisStreamConsumer {
    conn: ConnectionManager,
    keys: Vec<String>,
    cursors: Vec<String>,
}

#[async_trait]
impl LogConsumer for RedisStreamConsumer {
    async fn next_batch(&mut self) -> Result<Vec<LogRecord>> {
        let options = StreamReadOptions::default().block(READ_BLOCK_MS).count(READ_BATCH);
        loop {
            let reply: Option<StreamReadReply> = self
                .conn
                .xread_options(&self.keys, &self.cursors, &options)
                .await
                .map_err(|e| AppError::EventLog(e.to_string()))?;

            let Some(reply) = reply else { continue };

            let mut batch = Vec::new();
            for stream in reply.keys {
                let Some(partition) = self.keys.iter().position(|k| *k == stream.key) else {
                    continue;
                };
                for entry in stream.ids {
                    self.cursors[partition] = entry.id.clone();
                    let Some(payload) = entry.get::<String>(PAYLOAD_FIELD) else {
                        warn!("Stream entry {} has no payload", entry.id);
                        continue;
                    };
                    match serde_json::from_str::<NotificationEvent>(&payload) {
                        Ok(event) => batch.push(LogRecord {
                            position: LogPosition { partition, offset: entry.id.clone() },
                            event,
                        }),
                        Err(e) => warn!("Skipping undecodable stream entry {}: {}", entry.id, e),
                    }
                }
            }

            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }
}
