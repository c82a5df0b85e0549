use crate::services::kv::SharedStore;
use std::collections::HashSet;
use tracing::{debug, warn};

/// 每个用户已读通知ID的集合
///
/// 集合中存在即已读，不存在即未读；不提供标记未读的操作。
#[derive(Clone)]
pub struct ReadStateTracker {
    store: SharedStore,
}

impl ReadStateTracker {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn key(recipient_id: &str) -> String {
        format!("notifications:read:{}", recipient_id)
    }

    /// 标记已读（幂等）；存储不可用时只记录日志，确认本身总是成功
    pub async fn mark_read(&self, recipient_id: &str, notification_id: i64) {
        match self
            .store
            .set_add(&Self::key(recipient_id), &notification_id.to_string())
            .await
        {
            Ok(added) => debug!(
                "Marked notification {} read for {} (newly added: {})",
                notification_id, recipient_id, added
            ),
            Err(e) => warn!(
                "Failed to mark notification {} read for {}: {}",
                notification_id, recipient_id, e
            ),
        }
    }

    /// 移除已离开历史列表的通知ID
    pub async fn forget(&self, recipient_id: &str, notification_ids: &[i64]) {
        if notification_ids.is_empty() {
            return;
        }
        let members: Vec<String> = notification_ids.iter().map(i64::to_string).collect();
        if let Err(e) = self.store.set_remove(&Self::key(recipient_id), &members).await {
            warn!("Failed to prune read state for {}: {}", recipient_id, e);
        }
    }

    /// 存储不可用时视为未读
    pub async fn is_read(&self, recipient_id: &str, notification_id: i64) -> bool {
        match self
            .store
            .set_is_member(&Self::key(recipient_id), &notification_id.to_string())
            .await
        {
            Ok(read) => read,
            Err(e) => {
                warn!("Read-state lookup failed for {}: {}", recipient_id, e);
                false
            }
        }
    }

    /// 一次取回全部已读ID，存储不可用时返回空集合
    pub async fn read_ids(&self, recipient_id: &str) -> HashSet<i64> {
        match self.store.set_members(&Self::key(recipient_id)).await {
            Ok(members) => members.iter().filter_map(|m| m.parse().ok()).collect(),
            Err(e) => {
                warn!("Read-state listing failed for {}: {}", recipient_id, e);
                HashSet::new()
            }
        }
    }
}
