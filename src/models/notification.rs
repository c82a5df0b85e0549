use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use validator::Validate;

/// 通知类型（固定枚举集合）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Comment,
    Reply,
    Like,
    System,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationType::Comment => "COMMENT",
            NotificationType::Reply => "REPLY",
            NotificationType::Like => "LIKE",
            NotificationType::System => "SYSTEM",
        };
        f.write_str(name)
    }
}

/// 通知事件
///
/// 发布后不可变。`is_read` 只是请求时的投影，存储中始终为 `false`，
/// 读状态以 ReadStateTracker 的集合为准。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub id: i64,
    pub recipient_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar_url: Option<String>,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub content: String,
    pub post_id: Option<i64>,
    pub comment_id: Option<i64>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// 复制一份并设置读状态投影
    pub fn with_read(mut self, is_read: bool) -> Self {
        self.is_read = is_read;
        self
    }

    pub fn payload(&self) -> NotificationPayload {
        NotificationPayload::from(self)
    }
}

/// 推送给客户端的通知结构
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub content: String,
    pub sender_name: String,
    pub sender_avatar_url: Option<String>,
    pub post_id: Option<i64>,
    pub comment_id: Option<i64>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&NotificationEvent> for NotificationPayload {
    fn from(event: &NotificationEvent) -> Self {
        Self {
            id: event.id,
            kind: event.kind,
            content: event.content.clone(),
            sender_name: event.sender_name.clone(),
            sender_avatar_url: event.sender_avatar_url.clone(),
            post_id: event.post_id,
            comment_id: event.comment_id,
            read: event.is_read,
            created_at: event.created_at,
        }
    }
}

/// 待发布的通知草稿，由 NotificationService 填充发送者信息后生成事件
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub recipient_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar_url: Option<String>,
    pub kind: NotificationType,
    pub content: String,
    pub post_id: Option<i64>,
    pub comment_id: Option<i64>,
}

/// 自定义纪元 2024-01-01T00:00:00Z
const ID_EPOCH_MILLIS: i64 = 1_704_067_200_000;
const SEQUENCE_BITS: u32 = 6;
const NODE_BITS: u32 = 6;
/// 参与生成ID的实例数上限
pub const MAX_ID_NODES: u16 = 1 << NODE_BITS;

/// 时间有序的通知ID生成器
///
/// ID 由三段组成：自纪元起的毫秒数、毫秒内序号、实例号。同一实例内严格单调，
/// 不同实例号的生成器之间不会冲突，整体保持在 2^53 以内，便于前端按数字处理。
/// 同一毫秒内序号用尽时借用下一毫秒。
#[derive(Debug, Default)]
pub struct NotificationIdGenerator {
    node: i64,
    last: AtomicI64,
}

impl NotificationIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定实例号，超出范围时取模
    pub fn with_node(node: u16) -> Self {
        Self {
            node: i64::from(node % MAX_ID_NODES),
            last: AtomicI64::new(0),
        }
    }

    pub fn node(&self) -> u16 {
        self.node as u16
    }

    pub fn next_id(&self) -> i64 {
        let elapsed = (Utc::now().timestamp_millis() - ID_EPOCH_MILLIS).max(0);
        let now = elapsed << SEQUENCE_BITS;
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = if now > current { now } else { current + 1 };
            match self
                .last
                .compare_exchange_weak(current, candidate, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return (candidate << NODE_BITS) | self.node,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn build(&self, draft: NotificationDraft) -> NotificationEvent {
        NotificationEvent {
            id: self.next_id(),
            recipient_id: draft.recipient_id,
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            sender_avatar_url: draft.sender_avatar_url,
            kind: draft.kind,
            content: draft.content,
            post_id: draft.post_id,
            comment_id: draft.comment_id,
            is_read: false,
            created_at: Utc::now(),
        }
    }
}

/// 系统通知请求
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SystemNotificationRequest {
    #[validate(length(min = 1, max = 200))]
    pub recipient_id: String,
    #[validate(length(min = 1, max = 1000))]
    pub content: String,
}

/// 历史查询参数
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub user_id: String,
    pub limit: Option<usize>,
}

/// 需要指定接收者的查询参数
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientQuery {
    pub user_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn draft() -> NotificationDraft {
        NotificationDraft {
            recipient_id: "bob".to_string(),
            sender_id: "alice".to_string(),
            sender_name: "Alice".to_string(),
            sender_avatar_url: None,
            kind: NotificationType::Comment,
            content: "hello".to_string(),
            post_id: Some(7),
            comment_id: Some(11),
        }
    }

    #[test]
    fn test_ids_strictly_increase() {
        let generator = NotificationIdGenerator::new();
        let mut last = 0;
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = generator.next_id();
            assert!(id > last);
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn test_ids_from_different_nodes_never_collide() {
        let first = NotificationIdGenerator::with_node(1);
        let second = NotificationIdGenerator::with_node(2);
        let mut seen = HashSet::new();
        for _ in 0..500 {
            assert!(seen.insert(first.next_id()));
            assert!(seen.insert(second.next_id()));
        }
        // 前端按 JS 数字处理，不能超过 2^53
        assert!(seen.iter().all(|id| *id > 0 && *id < (1i64 << 53)));
    }

    #[test]
    fn test_node_is_wrapped() {
        assert_eq!(NotificationIdGenerator::with_node(MAX_ID_NODES + 3).node(), 3);
        let id = NotificationIdGenerator::with_node(5).next_id();
        assert_eq!(id & i64::from(MAX_ID_NODES - 1), 5);
    }

    #[test]
    fn test_payload_wire_format() {
        let event = NotificationIdGenerator::new().build(draft());
        let value = serde_json::to_value(event.payload()).unwrap();

        assert_eq!(value["type"], "COMMENT");
        assert_eq!(value["senderName"], "Alice");
        assert_eq!(value["postId"], 7);
        assert_eq!(value["commentId"], 11);
        assert_eq!(value["read"], false);
        assert!(value.get("createdAt").is_some());
        assert!(value.get("recipientId").is_none());
    }

    #[test]
    fn test_stored_event_keeps_recipient() {
        let event = NotificationIdGenerator::new().build(draft());
        let json = serde_json::to_string(&event).unwrap();
        let decoded: NotificationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.recipient_id, "bob");
        assert_eq!(decoded.kind, NotificationType::Comment);
    }
}
