pub mod directory;
pub mod event_log;
pub mod gateway;
pub mod history;
pub mod hub;
pub mod kv;
pub mod notification;
pub mod publisher;
pub mod read_state;
pub mod token;

#[cfg(feature = "redis-cache")]
pub mod redis_log;
#[cfg(feature = "redis-cache")]
pub mod redis_store;

// 重新导出常用类型
pub use directory::{HttpUserDirectory, StaticUserDirectory, UserDirectory};
pub use event_log::{EventLog, MemoryEventLog};
pub use gateway::StreamGateway;
pub use history::RecentHistoryStore;
pub use hub::NotificationHub;
pub use kv::{KeyValueStore, MemoryStore};
pub use notification::NotificationService;
pub use publisher::EventPublisher;
pub use read_state::ReadStateTracker;
pub use token::TokenAuthority;
