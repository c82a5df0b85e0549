use crate::{
    error::Result,
    models::notification::NotificationEvent,
    services::{kv::SharedStore, read_state::ReadStateTracker},
};
use tracing::{debug, warn};

/// 每个用户最近通知的定长列表（新的在前）
///
/// 只有 NotificationHub 写入；查询返回调用时刻的快照。
#[derive(Clone)]
pub struct RecentHistoryStore {
    store: SharedStore,
    read_state: ReadStateTracker,
    capacity: usize,
}

impl RecentHistoryStore {
    pub fn new(store: SharedStore, read_state: ReadStateTracker, capacity: usize) -> Self {
        Self {
            store,
            read_state,
            capacity: capacity.max(1),
        }
    }

    fn key(recipient_id: &str) -> String {
        format!("notifications:{}", recipient_id)
    }

    // 当前列表中的通知ID，用于跨实例的原子去重
    fn seen_key(recipient_id: &str) -> String {
        format!("notifications:seen:{}", recipient_id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 头插并截断；同一ID重复投递时忽略，返回是否实际写入
    ///
    /// 去重依赖 SADD 的原子性：多个实例同时消费同一条记录时只有一个能写入。
    /// 被截掉的通知同时从去重集合和已读集合中移除。
    pub async fn append(&self, recipient_id: &str, event: &NotificationEvent) -> Result<bool> {
        let seen_key = Self::seen_key(recipient_id);
        let id = event.id.to_string();
        if !self.store.set_add(&seen_key, &id).await? {
            debug!("Notification {} already in history for {}", event.id, recipient_id);
            return Ok(false);
        }

        // 存储的副本不携带读状态
        let pushed = match serde_json::to_string(&event.clone().with_read(false)) {
            Ok(payload) => self
                .store
                .push_front_capped(&Self::key(recipient_id), &payload, self.capacity)
                .await,
            Err(e) => Err(e.into()),
        };
        let evicted = match pushed {
            Ok(evicted) => evicted,
            Err(e) => {
                if let Err(undo) = self.store.set_remove(&seen_key, &[id]).await {
                    warn!("Failed to release notification {} for {}: {}", event.id, recipient_id, undo);
                }
                return Err(e);
            }
        };

        let evicted_ids: Vec<i64> = evicted.iter().filter_map(|raw| decode(raw)).map(|e| e.id).collect();
        if !evicted_ids.is_empty() {
            let members: Vec<String> = evicted_ids.iter().map(i64::to_string).collect();
            if let Err(e) = self.store.set_remove(&seen_key, &members).await {
                warn!("Failed to prune history index for {}: {}", recipient_id, e);
            }
            self.read_state.forget(recipient_id, &evicted_ids).await;
            debug!("Evicted {} notifications from history for {}", evicted_ids.len(), recipient_id);
        }
        Ok(true)
    }

    async fn stored(&self, recipient_id: &str) -> Vec<NotificationEvent> {
        match self.store.list_range(&Self::key(recipient_id)).await {
            Ok(raw) => raw.iter().filter_map(|r| decode(r)).collect(),
            Err(e) => {
                warn!("History lookup failed for {}: {}", recipient_id, e);
                Vec::new()
            }
        }
    }

    /// 全部历史，附带读状态投影
    pub async fn list(&self, recipient_id: &str) -> Vec<NotificationEvent> {
        let events = self.stored(recipient_id).await;
        if events.is_empty() {
            return events;
        }
        let read = self.read_state.read_ids(recipient_id).await;
        events
            .into_iter()
            .map(|e| {
                let is_read = read.contains(&e.id);
                e.with_read(is_read)
            })
            .collect()
    }

    /// 按存储顺序取未读通知，最多 `limit` 条
    pub async fn list_unread(&self, recipient_id: &str, limit: usize) -> Vec<NotificationEvent> {
        let limit = limit.min(self.capacity);
        if limit == 0 {
            return Vec::new();
        }

        let events = self.stored(recipient_id).await;
        if events.is_empty() {
            return events;
        }
        let read = self.read_state.read_ids(recipient_id).await;

        events
            .into_iter()
            .filter(|e| !read.contains(&e.id))
            .take(limit)
            .collect()
    }
}

fn decode(raw: &str) -> Option<NotificationEvent> {
    match serde_json::from_str(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Skipping undecodable history entry: {}", e);
            None
        }
    }
}
