use crate::{
    error::Result,
    models::notification::NotificationEvent,
    services::{event_log::SharedLog, history::RecentHistoryStore},
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Channels = DashMap<String, broadcast::Sender<Arc<NotificationEvent>>>;

/// 订阅收到的内容
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Arc<NotificationEvent>),
    /// 订阅者太慢，最旧的 n 条已被丢弃
    Lagged(u64),
}

/// 单个接收者的一个实时订阅
///
/// 丢弃时自动退订；同一接收者的最后一个订阅退出后注册表项被移除。
pub struct Subscription {
    recipient_id: String,
    receiver: broadcast::Receiver<Arc<NotificationEvent>>,
    channels: Arc<Channels>,
}

impl Subscription {
    /// 等待下一条投递，通道关闭时返回 None
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.receiver.recv().await {
            Ok(event) => Some(Delivery::Event(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Some(Delivery::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // receiver 字段此时尚未释放，计数中仍包含自己
        let removed = self
            .channels
            .remove_if(&self.recipient_id, |_, sender| sender.receiver_count() <= 1)
            .is_some();
        if removed {
            debug!("Last subscription for {} closed", self.recipient_id);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connected_recipients: usize,
    pub active_subscriptions: usize,
    pub dispatched: u64,
    pub delivered: u64,
}

/// 通知中心：消费事件日志，向在线订阅者扇出，并写入最近历史
#[derive(Clone)]
pub struct NotificationHub {
    channels: Arc<Channels>,
    history: RecentHistoryStore,
    buffer: usize,
    dispatched: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
}

impl NotificationHub {
    pub fn new(history: RecentHistoryStore, buffer: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            history,
            buffer: buffer.max(1),
            dispatched: Arc::new(AtomicU64::new(0)),
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 注册实时订阅，只接收此后分发的事件
    pub fn subscribe(&self, recipient_id: &str) -> Subscription {
        let receiver = self
            .channels
            .entry(recipient_id.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe();

        debug!("New subscription for {}", recipient_id);
        Subscription {
            recipient_id: recipient_id.to_string(),
            receiver,
            channels: self.channels.clone(),
        }
    }

    /// 推送给在线订阅者，然后写入历史
    pub async fn dispatch(&self, event: NotificationEvent) {
        let event = Arc::new(event);
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let receivers = self
            .channels
            .get(&event.recipient_id)
            .map(|sender| sender.send(event.clone()).unwrap_or(0))
            .unwrap_or(0);
        self.delivered.fetch_add(receivers as u64, Ordering::Relaxed);

        debug!(
            "Dispatched notification {} to {} live subscription(s) of {}",
            event.id, receivers, event.recipient_id
        );

        if let Err(e) = self.history.append(&event.recipient_id, &event).await {
            warn!("Failed to record notification {} in history: {}", event.id, e);
        }
    }

    /// 从日志当前尾部开始消费并后台运行，直到收到关闭信号
    pub async fn spawn(&self, log: SharedLog, mut shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let mut consumer = log.consumer().await?;
        let hub = self.clone();
        info!("Notification hub consuming {} partition(s)", log.partitions());

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("Notification hub stopping");
                        break;
                    }
                    batch = consumer.next_batch() => match batch {
                        Ok(records) => {
                            for record in records {
                                hub.dispatch(record.event).await;
                            }
                        }
                        Err(e) => {
                            error!("Event log read failed: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }))
    }

    /// 关闭全部订阅，停机时使用
    pub fn close_all(&self) {
        let recipients = self.channels.len();
        self.channels.clear();
        info!("Closed live subscriptions of {} recipient(s)", recipients);
    }

    pub fn connected_recipients(&self) -> usize {
        self.channels.len()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.channels.iter().map(|entry| entry.value().receiver_count()).sum()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connected_recipients: self.connected_recipients(),
            active_subscriptions: self.active_subscriptions(),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}
