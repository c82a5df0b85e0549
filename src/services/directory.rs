use crate::{
    config::Config,
    error::{AppError, Result},
    models::comment::UserProfile,
    utils::middleware::INTERNAL_TOKEN_HEADER,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 用户与文章归属的查询接口，由博客主服务提供
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>>;

    async fn get_post_author(&self, post_id: i64) -> Result<Option<String>>;
}

pub type SharedDirectory = Arc<dyn UserDirectory>;

/// 进程内目录，开发环境与测试使用
#[derive(Clone, Default)]
pub struct StaticUserDirectory {
    users: Arc<DashMap<String, UserProfile>>,
    post_authors: Arc<DashMap<i64, String>>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, profile: UserProfile) {
        self.users.insert(profile.user_id.clone(), profile);
    }

    pub fn insert_post(&self, post_id: i64, author_id: impl Into<String>) {
        self.post_authors.insert(post_id, author_id.into());
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.users.get(user_id).map(|entry| entry.value().clone()))
    }

    async fn get_post_author(&self, post_id: i64) -> Result<Option<String>> {
        Ok(self.post_authors.get(&post_id).map(|entry| entry.value().clone()))
    }
}

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

/// 博客主服务统一的响应包装
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostAuthorResponse {
    author_id: String,
}

/// 通过博客主服务的内部接口查询用户与文章作者
///
/// 命中结果按 `DIRECTORY_CACHE_SECS` 缓存；查不到（404）的结果不缓存。
#[derive(Clone)]
pub struct HttpUserDirectory {
    base_url: String,
    internal_token: String,
    http_client: Client,
    cache_ttl: Duration,
    users: Arc<DashMap<String, Cached<UserProfile>>>,
    post_authors: Arc<DashMap<i64, Cached<String>>>,
}

impl HttpUserDirectory {
    pub fn new(base_url: &str, config: &Config) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_millis(config.directory_timeout_ms.max(1)))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            internal_token: config.internal_api_token.clone(),
            http_client,
            cache_ttl: Duration::seconds(i64::try_from(config.directory_cache_secs).unwrap_or(i64::MAX).min(86_400)),
            users: Arc::new(DashMap::new()),
            post_authors: Arc::new(DashMap::new()),
        })
    }

    /// 清理过期缓存，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.users.len() + self.post_authors.len();
        self.users.retain(|_, cached| cached.expires_at > now);
        self.post_authors.retain(|_, cached| cached.expires_at > now);
        before.saturating_sub(self.users.len() + self.post_authors.len())
    }

    fn cached<K, V>(map: &DashMap<K, Cached<V>>, key: &K) -> Option<V>
    where
        K: std::hash::Hash + Eq,
        V: Clone,
    {
        map.get(key)
            .filter(|cached| cached.expires_at > Utc::now())
            .map(|cached| cached.value.clone())
    }

    fn remember<K, V>(&self, map: &DashMap<K, Cached<V>>, key: K, value: V)
    where
        K: std::hash::Hash + Eq,
    {
        map.insert(
            key,
            Cached {
                value,
                expires_at: Utc::now() + self.cache_ttl,
            },
        );
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .get(&url)
            .header(INTERNAL_TOKEN_HEADER, &self.internal_token)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to reach blog service at {}: {}", url, e);
                AppError::ExternalService("Failed to reach blog service".to_string())
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("Blog service has no record at {}", url);
                Ok(None)
            }
            status if status.is_success() => {
                let envelope: Envelope<T> = response.json().await.map_err(|e| {
                    error!("Failed to parse blog service response from {}: {}", url, e);
                    AppError::ExternalService("Invalid response from blog service".to_string())
                })?;
                Ok(envelope.data)
            }
            status => {
                warn!("Blog service returned {} for {}", status, url);
                Err(AppError::ExternalService(format!("Blog service returned {}", status)))
            }
        }
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        if let Some(profile) = Self::cached(&self.users, &user_id.to_string()) {
            debug!("Using cached profile for user: {}", user_id);
            return Ok(Some(profile));
        }

        let profile: Option<UserProfile> = self.fetch(&format!("/api/internal/users/{}", user_id)).await?;
        if let Some(profile) = &profile {
            self.remember(&self.users, user_id.to_string(), profile.clone());
        }
        Ok(profile)
    }

    async fn get_post_author(&self, post_id: i64) -> Result<Option<String>> {
        if let Some(author) = Self::cached(&self.post_authors, &post_id) {
            return Ok(Some(author));
        }

        let post: Option<PostAuthorResponse> = self.fetch(&format!("/api/internal/posts/{}", post_id)).await?;
        let author = post.map(|p| p.author_id);
        if let Some(author) = &author {
            self.remember(&self.post_authors, post_id, author.clone());
        }
        Ok(author)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_directory(server: &MockServer) -> HttpUserDirectory {
        HttpUserDirectory::new(&server.uri(), &Config::for_tests()).unwrap()
    }

    #[tokio::test]
    async fn test_http_directory_fetches_and_caches_users() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/internal/users/alice"))
            .and(header(INTERNAL_TOKEN_HEADER, "internal-test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "userId": "alice", "displayName": "Alice", "avatarUrl": "https://cdn/a.png" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let directory = http_directory(&server);
        for _ in 0..3 {
            let alice = directory.find_user("alice").await.unwrap().unwrap();
            assert_eq!(alice.display_name, "Alice");
            assert_eq!(alice.avatar_url.as_deref(), Some("https://cdn/a.png"));
        }
    }

    #[tokio::test]
    async fn test_http_directory_post_author_and_misses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/internal/posts/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "id": 7, "authorId": "bob" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/internal/users/nobody"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/internal/posts/8"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let directory = http_directory(&server);
        assert_eq!(directory.get_post_author(7).await.unwrap().as_deref(), Some("bob"));
        assert!(directory.find_user("nobody").await.unwrap().is_none());
        assert!(matches!(
            directory.get_post_author(8).await,
            Err(AppError::ExternalService(_))
        ));
        assert_eq!(directory.purge_expired(), 0);
    }

    #[test]
    fn test_lookup() {
        let directory = StaticUserDirectory::new();
        directory.insert_user(UserProfile {
            user_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            avatar_url: None,
        });
        directory.insert_post(7, "bob");

        let alice = tokio_test::block_on(directory.find_user("alice")).unwrap();
        assert_eq!(alice.unwrap().display_name, "Alice");
        assert!(tokio_test::block_on(directory.find_user("nobody")).unwrap().is_none());
        assert_eq!(
            tokio_test::block_on(directory.get_post_author(7)).unwrap().as_deref(),
            Some("bob")
        );
        assert!(tokio_test::block_on(directory.get_post_author(8)).unwrap().is_none());
    }
}
