use crate::{
    models::notification::NotificationEvent,
    services::event_log::{LogPosition, SharedLog},
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// 发布结果
///
/// 发布失败不会向上传播成错误，调用方的业务事务不受影响。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Appended(LogPosition),
    Degraded,
}

impl PublishOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, PublishOutcome::Appended(_))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub degraded: u64,
}

/// 事件发布者：把通知追加到按接收者分区的事件日志
#[derive(Clone)]
pub struct EventPublisher {
    log: SharedLog,
    timeout: Duration,
    published: Arc<AtomicU64>,
    degraded: Arc<AtomicU64>,
}

impl EventPublisher {
    pub fn new(log: SharedLog, timeout: Duration) -> Self {
        Self {
            log,
            timeout,
            published: Arc::new(AtomicU64::new(0)),
            degraded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn publish(&self, event: &NotificationEvent) -> PublishOutcome {
        match tokio::time::timeout(self.timeout, self.log.append(event)).await {
            Ok(Ok(position)) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Published notification {} for recipient {} to partition {}",
                    event.id, event.recipient_id, position.partition
                );
                PublishOutcome::Appended(position)
            }
            Ok(Err(e)) => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
                error!("Failed to publish notification {} for {}: {}", event.id, event.recipient_id, e);
                PublishOutcome::Degraded
            }
            Err(_) => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Publishing notification {} for {} timed out after {:?}",
                    event.id, event.recipient_id, self.timeout
                );
                PublishOutcome::Degraded
            }
        }
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}
