use crate::error::{AppError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// 键值存储抽象
///
/// 通知子系统只依赖这一组按键原子的操作：带过期的字符串、
/// 定长列表（头插 + 截断）以及集合。每个操作只触及单个键，
/// 因此不需要应用层的跨键锁。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// 删除键，返回键是否存在
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// 头插并截断到 `cap`，返回被截掉的元素（旧的在后）
    async fn push_front_capped(&self, key: &str, value: &str, cap: usize) -> Result<Vec<String>>;

    /// 列表全部元素，头部在前
    async fn list_range(&self, key: &str) -> Result<Vec<String>>;

    /// 加入集合，返回是否为新成员
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// 从集合移除成员，返回实际移除的数量
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize>;

    /// 自增计数器，返回自增后的值；键不存在时从 0 开始
    async fn incr(&self, key: &str) -> Result<i64>;

    async fn ping(&self) -> Result<()>;
}

pub type SharedStore = Arc<dyn KeyValueStore>;

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// 进程内键值存储
///
/// 过期在读取时惰性判断，并由后台任务定期清扫。
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<DashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清理过期项，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.data.len());
        if removed > 0 {
            debug!("Purged {} expired key-value entries", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn live_entry(&self, key: &str) -> Option<StoredEntry> {
        let now = Instant::now();
        let entry = self.data.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.data.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry.clone())
    }

    fn wrong_type(key: &str) -> AppError {
        AppError::KeyValue(format!("WRONGTYPE operation against key '{}'", key))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live_entry(key) {
            None => Ok(None),
            Some(StoredEntry { value: StoredValue::Text(text), .. }) => Ok(Some(text)),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.data.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .map_or(false, |(_, entry)| !entry.is_expired(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_entry(key).is_some())
    }

    async fn push_front_capped(&self, key: &str, value: &str, cap: usize) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| StoredEntry {
            value: StoredValue::List(VecDeque::new()),
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = StoredEntry {
                value: StoredValue::List(VecDeque::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            StoredValue::List(list) => {
                list.push_front(value.to_string());
                let evicted = if list.len() > cap {
                    list.split_off(cap).into_iter().collect()
                } else {
                    Vec::new()
                };
                Ok(evicted)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        match self.live_entry(key) {
            None => Ok(Vec::new()),
            Some(StoredEntry { value: StoredValue::List(list), .. }) => Ok(list.into_iter().collect()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| StoredEntry {
            value: StoredValue::Set(HashSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            StoredValue::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool> {
        match self.live_entry(key) {
            None => Ok(false),
            Some(StoredEntry { value: StoredValue::Set(set), .. }) => Ok(set.contains(member)),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        match self.live_entry(key) {
            None => Ok(Vec::new()),
            Some(StoredEntry { value: StoredValue::Set(set), .. }) => Ok(set.into_iter().collect()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize> {
        let Some(mut entry) = self.data.get_mut(key) else {
            return Ok(0);
        };
        let removed = match &mut entry.value {
            StoredValue::Set(set) => members.iter().filter(|m| set.remove(m.as_str())).count(),
            _ => return Err(Self::wrong_type(key)),
        };
        let emptied = matches!(&entry.value, StoredValue::Set(set) if set.is_empty());
        drop(entry);
        if emptied {
            self.data
                .remove_if(key, |_, e| matches!(&e.value, StoredValue::Set(set) if set.is_empty()));
        }
        Ok(removed)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| StoredEntry {
            value: StoredValue::Text("0".to_string()),
            expires_at: None,
        });
        match &mut entry.value {
            StoredValue::Text(text) => {
                let next = text
                    .parse::<i64>()
                    .map_err(|_| AppError::KeyValue(format!("value at '{}' is not an integer", key)))?
                    .checked_add(1)
                    .ok_or_else(|| AppError::KeyValue(format!("increment at '{}' would overflow", key)))?;
                *text = next.to_string();
                Ok(next)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_text_with_ttl() {
        let store = MemoryStore::new();
        store.set_with_ttl("token:alice", "jwt", Duration::from_millis(80)).await.unwrap();
        assert_eq!(store.get("token:alice").await.unwrap(), Some("jwt".to_string()));
        assert!(store.exists("token:alice").await.unwrap());

        sleep(Duration::from_millis(120)).await;
        assert_eq!(store.get("token:alice").await.unwrap(), None);
        assert!(!store.exists("token:alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let store = MemoryStore::new();
        assert!(!store.delete("missing").await.unwrap());
        store.set_with_ttl("k", "v", Duration::from_secs(10)).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_push_front_capped_keeps_newest() {
        let store = MemoryStore::new();
        for i in 0..3 {
            assert!(store.push_front_capped("list", &i.to_string(), 3).await.unwrap().is_empty());
        }
        assert_eq!(store.push_front_capped("list", "3", 3).await.unwrap(), vec!["0"]);
        assert_eq!(store.push_front_capped("list", "4", 3).await.unwrap(), vec!["1"]);
        assert_eq!(store.list_range("list").await.unwrap(), vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn test_set_remove_and_incr() {
        let store = MemoryStore::new();
        store.set_add("seen", "1").await.unwrap();
        store.set_add("seen", "2").await.unwrap();
        let removed = store
            .set_remove("seen", &["1".to_string(), "9".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.set_members("seen").await.unwrap(), vec!["2".to_string()]);
        assert_eq!(store.set_remove("missing", &["1".to_string()]).await.unwrap(), 0);

        store.set_remove("seen", &["2".to_string()]).await.unwrap();
        assert!(!store.exists("seen").await.unwrap());

        assert_eq!(store.incr("counter").await.unwrap(), 1);
        assert_eq!(store.incr("counter").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_set_membership() {
        let store = MemoryStore::new();
        assert!(store.set_add("read", "1").await.unwrap());
        assert!(!store.set_add("read", "1").await.unwrap());
        assert!(store.set_is_member("read", "1").await.unwrap());
        assert!(!store.set_is_member("read", "2").await.unwrap());
        assert_eq!(store.set_members("read").await.unwrap(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_wrong_type_is_error() {
        let store = MemoryStore::new();
        store.set_add("key", "x").await.unwrap();
        assert!(store.get("key").await.is_err());
        assert!(store.push_front_capped("key", "y", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set_with_ttl("short", "v", Duration::from_millis(10)).await.unwrap();
        store.set_with_ttl("long", "v", Duration::from_secs(60)).await.unwrap();
        sleep(Duration::from_millis(30)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
