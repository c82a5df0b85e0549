use crate::{
    error::{AppError, Result},
    models::notification::NotificationEvent,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// 记录在日志中的位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogPosition {
    pub partition: usize,
    pub offset: String,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub position: LogPosition,
    pub event: NotificationEvent,
}

/// 按接收者分区的有序事件日志
///
/// 同一接收者的事件总是落在同一分区，因此彼此全序；跨接收者不保证顺序。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: &NotificationEvent) -> Result<LogPosition>;

    /// 打开一个从当前尾部开始的消费者（只接收之后追加的记录）
    async fn consumer(&self) -> Result<Box<dyn LogConsumer>>;

    fn partitions(&self) -> usize;
}

#[async_trait]
pub trait LogConsumer: Send {
    /// 等待并返回下一批记录，每个分区内保持追加顺序
    async fn next_batch(&mut self) -> Result<Vec<LogRecord>>;
}

pub type SharedLog = Arc<dyn EventLog>;

/// 稳定的分区哈希 (FNV-1a)，跨进程一致
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % partitions.max(1) as u64) as usize
}

#[derive(Debug, Default)]
struct Partition {
    // 队首记录的偏移量
    base_offset: u64,
    records: VecDeque<NotificationEvent>,
}

impl Partition {
    fn next_offset(&self) -> u64 {
        self.base_offset + self.records.len() as u64
    }
}

/// 进程内事件日志
///
/// 每个分区是一个只追加的队列，超过保留条数后丢弃最旧的记录。
#[derive(Clone)]
pub struct MemoryEventLog {
    partitions: Arc<Vec<Mutex<Partition>>>,
    retention: usize,
    appended: Arc<Notify>,
}

impl MemoryEventLog {
    pub fn new(partitions: usize, retention: usize) -> Self {
        let partitions = (0..partitions.max(1)).map(|_| Mutex::new(Partition::default())).collect();
        Self {
            partitions: Arc::new(partitions),
            retention: retention.max(1),
            appended: Arc::new(Notify::new()),
        }
    }

    fn lock(&self, index: usize) -> Result<std::sync::MutexGuard<'_, Partition>> {
        self.partitions[index]
            .lock()
            .map_err(|_| AppError::EventLog(format!("partition {} lock poisoned", index)))
    }

    /// 每个分区当前保留的记录数
    pub fn retained(&self) -> Vec<usize> {
        self.partitions
            .iter()
            .map(|p| p.lock().map(|p| p.records.len()).unwrap_or(0))
            .collect()
    }

    fn tail_offsets(&self) -> Result<Vec<u64>> {
        (0..self.partitions.len())
            .map(|index| self.lock(index).map(|p| p.next_offset()))
            .collect()
    }

    fn read_from(&self, cursors: &mut [u64]) -> Result<Vec<LogRecord>> {
        let mut batch = Vec::new();
        for (index, cursor) in cursors.iter_mut().enumerate() {
            let partition = self.lock(index)?;
            if *cursor < partition.base_offset {
                warn!(
                    "Consumer fell behind retention on partition {}: skipped {} records",
                    index,
                    partition.base_offset - *cursor
                );
                *cursor = partition.base_offset;
            }
            let start = (*cursor - partition.base_offset) as usize;
            for (i, event) in partition.records.iter().enumerate().skip(start) {
                batch.push(LogRecord {
                    position: LogPosition {
                        partition: index,
                        offset: (partition.base_offset + i as u64).to_string(),
                    },
                    event: event.clone(),
                });
            }
            *cursor = partition.next_offset();
        }
        Ok(batch)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: &NotificationEvent) -> Result<LogPosition> {
        let index = partition_for(&event.recipient_id, self.partitions.len());
        let offset = {
            let mut partition = self.lock(index)?;
            let offset = partition.next_offset();
            partition.records.push_back(event.clone());
            while partition.records.len() > self.retention {
                partition.records.pop_front();
                partition.base_offset += 1;
            }
            offset
        };
        self.appended.notify_waiters();

        debug!("Appended notification {} to partition {} at offset {}", event.id, index, offset);
        Ok(LogPosition {
            partition: index,
            offset: offset.to_string(),
        })
    }

    async fn consumer(&self) -> Result<Box<dyn LogConsumer>> {
        Ok(Box::new(MemoryLogConsumer {
            cursors: self.tail_offsets()?,
            log: self.clone(),
        }))
    }

    fn partitions(&self) -> usize {
        self.partitions.len()
    }
}

struct MemoryLogConsumer {
    log: MemoryEventLog,
    cursors: Vec<u64>,
}

#[async_trait]
impl LogConsumer for MemoryLogConsumer {
    async fn next_batch(&mut self) -> Result<Vec<LogRecord>> {
        loop {
            // 先注册等待再检查，避免检查与等待之间的追加被漏掉
            let appended = self.log.appended.clone();
            let notified = appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.log.read_from(&mut self.cursors)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::notification::{NotificationDraft, NotificationIdGenerator, NotificationType};
    use std::time::Duration;

    fn event(ids: &NotificationIdGenerator, recipient: &str) -> NotificationEvent {
        ids.build(NotificationDraft {
            recipient_id: recipient.to_string(),
            sender_id: "sender".to_string(),
            sender_name: "Sender".to_string(),
            sender_avatar_url: None,
            kind: NotificationType::Like,
            content: "liked your post".to_string(),
            post_id: Some(1),
            comment_id: None,
        })
    }

    #[test]
    fn test_partition_is_stable() {
        assert_eq!(partition_for("alice", 8), partition_for("alice", 8));
        assert!(partition_for("bob", 8) < 8);
        assert_eq!(partition_for("anything", 1), 0);
    }

    #[tokio::test]
    async fn test_consumer_starts_at_tail() {
        let ids = NotificationIdGenerator::new();
        let log = MemoryEventLog::new(4, 100);
        log.append(&event(&ids, "alice")).await.unwrap();

        let mut consumer = log.consumer().await.unwrap();
        let fresh = event(&ids, "alice");
        log.append(&fresh).await.unwrap();

        let batch = consumer.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event.id, fresh.id);
        assert_eq!(batch[0].position.offset, "1");
    }

    #[tokio::test]
    async fn test_per_recipient_order_preserved() {
        let ids = NotificationIdGenerator::new();
        let log = MemoryEventLog::new(4, 100);
        let mut consumer = log.consumer().await.unwrap();

        let mut expected = Vec::new();
        for i in 0..20 {
            let recipient = if i % 2 == 0 { "alice" } else { "bob" };
            let e = event(&ids, recipient);
            if recipient == "alice" {
                expected.push(e.id);
            }
            log.append(&e).await.unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < expected.len() {
            let batch = consumer.next_batch().await.unwrap();
            seen.extend(batch.into_iter().filter(|r| r.event.recipient_id == "alice").map(|r| r.event.id));
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_append() {
        let ids = NotificationIdGenerator::new();
        let log = MemoryEventLog::new(2, 100);
        let mut consumer = log.consumer().await.unwrap();

        let writer = log.clone();
        let e = event(&ids, "carol");
        let expected = e.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(&e).await.unwrap();
        });

        let batch = tokio::time::timeout(Duration::from_secs(2), consumer.next_batch())
            .await
            .expect("consumer should wake")
            .unwrap();
        assert_eq!(batch[0].event.id, expected);
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let ids = NotificationIdGenerator::new();
        let log = MemoryEventLog::new(1, 3);
        for _ in 0..5 {
            log.append(&event(&ids, "dave")).await.unwrap();
        }
        assert_eq!(log.retained(), vec![3]);
    }
}
