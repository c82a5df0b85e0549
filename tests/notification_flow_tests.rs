use axum::{
    body::{Body, Bytes, HttpBody},
    http::{header, Request, StatusCode},
    Router,
};
use rainbow_notify::{
    build_router,
    config::Config,
    models::comment::{CommentCreatedRequest, UserProfile},
    services::{StaticUserDirectory, UserDirectory},
    state::AppState,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INTERNAL_TOKEN: &str = "internal-test-token";

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    _shutdown: watch::Sender<bool>,
}

async fn spawn_app() -> TestApp {
    let directory = StaticUserDirectory::new();
    for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
        directory.insert_user(UserProfile {
            user_id: id.to_string(),
            display_name: name.to_string(),
            avatar_url: None,
        });
    }
    directory.insert_post(7, "bob");
    assert!(directory.find_user("alice").await.unwrap().is_some());

    let state = Arc::new(AppState::in_memory(Config::for_tests(), Arc::new(directory)).unwrap());
    let (shutdown, shutdown_rx) = watch::channel(false);
    state
        .hub
        .spawn(state.event_log.clone(), shutdown_rx)
        .await
        .unwrap();

    TestApp {
        app: build_router(state.clone()),
        state,
        _shutdown: shutdown,
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn issue_token(&self, subject: &str) -> String {
        let (status, body) = self
            .send(internal_post("/api/notify/auth/token", json!({ "subject": subject })))
            .await;
        assert_eq!(status, StatusCode::OK);
        body["data"]["token"].as_str().unwrap().to_string()
    }

    async fn comment(&self, comment_id: i64, author: &str, content: &str) -> (StatusCode, Value) {
        self.send(internal_post(
            "/api/notify/events/comments",
            json!({
                "commentId": comment_id,
                "postId": 7,
                "userId": author,
                "content": content
            }),
        ))
        .await
    }

    async fn wait_for_history(&self, recipient: &str, count: usize) {
        for _ in 0..200 {
            if self.state.history.list(recipient).await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("history for {} never reached {} entries", recipient, count);
    }
}

fn internal_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-internal-token", INTERNAL_TOKEN)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

fn anonymous(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = spawn_app().await;
    let (status, body) = app.send(anonymous("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "up");
}

#[tokio::test]
async fn test_token_issue_requires_internal_token() {
    let app = spawn_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/notify/auth/token")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "subject": "bob" }).to_string()))
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTHENTICATION_ERROR");

    let token = app.issue_token("bob").await;
    let (status, body) = app.send(authed("GET", "/api/notify/auth/me", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["subject"], "bob");
    assert_eq!(body["data"]["authorities"], json!(["ROLE_USER"]));
}

#[tokio::test]
async fn test_comment_reaches_post_author_history() {
    let app = spawn_app().await;
    let token = app.issue_token("bob").await;

    let (status, body) = app.comment(1, "alice", "Great post!").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"][0]["content"], "Alice commented on your post: Great post!");

    app.wait_for_history("bob", 1).await;
    let (status, body) = app
        .send(authed("GET", "/api/notify/notifications?userId=bob", &token))
        .await;
    assert_eq!(status, StatusCode::OK);
    let list = body["data"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["type"], "COMMENT");
    assert_eq!(list[0]["senderName"], "Alice");
    assert_eq!(list[0]["postId"], 7);
    assert_eq!(list[0]["read"], false);
}

#[tokio::test]
async fn test_self_comment_produces_nothing() {
    let app = spawn_app().await;
    let (status, body) = app.comment(1, "bob", "replying on my own post").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"], json!([]));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(app.state.history.list("bob").await.is_empty());
}

#[tokio::test]
async fn test_mark_read_is_idempotent_and_filters_unread() {
    let app = spawn_app().await;
    let token = app.issue_token("bob").await;
    app.comment(1, "alice", "first").await;
    app.comment(2, "carol", "second").await;
    app.wait_for_history("bob", 2).await;

    let (_, body) = app
        .send(authed("GET", "/api/notify/notifications?userId=bob", &token))
        .await;
    let newest = body["data"][0]["id"].as_i64().unwrap();

    for _ in 0..2 {
        let uri = format!("/api/notify/notifications/{}/read?userId=bob", newest);
        let (status, _) = app.send(authed("POST", &uri, &token)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, unread) = app
        .send(authed("GET", "/api/notify/notifications?userId=bob", &token))
        .await;
    let unread = unread["data"].as_array().unwrap();
    assert_eq!(unread.len(), 1);
    assert_ne!(unread[0]["id"].as_i64().unwrap(), newest);

    let (_, all) = app
        .send(authed("GET", "/api/notify/notifications/all?userId=bob", &token))
        .await;
    let all = all["data"].as_array().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0]["read"], true);
    assert_eq!(all[1]["read"], false);
}

#[tokio::test]
async fn test_unread_limit_is_applied() {
    let app = spawn_app().await;
    let token = app.issue_token("bob").await;
    for id in 0..5 {
        app.comment(id, "alice", "hello").await;
    }
    app.wait_for_history("bob", 5).await;

    let (_, body) = app
        .send(authed("GET", "/api/notify/notifications?userId=bob&limit=3", &token))
        .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_history_is_capped_at_one_hundred() {
    let app = spawn_app().await;
    let token = app.issue_token("bob").await;
    for n in 0..150 {
        app.state
            .notification_service
            .send_system_notification("bob", &format!("notice {}", n))
            .await
            .unwrap();
    }
    for _ in 0..200 {
        let newest = app.state.history.list("bob").await.first().map(|e| e.content.clone());
        if newest.as_deref() == Some("notice 149") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (_, body) = app
        .send(authed("GET", "/api/notify/notifications/all?userId=bob", &token))
        .await;
    let all = body["data"].as_array().unwrap();
    assert_eq!(all.len(), 100);
    assert_eq!(all[0]["content"], "notice 149");
    assert_eq!(all[99]["content"], "notice 50");
}

#[tokio::test]
async fn test_access_control() {
    let app = spawn_app().await;
    let token = app.issue_token("bob").await;

    let (status, _) = app.send(anonymous("/api/notify/notifications?userId=bob")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .send(authed("GET", "/api/notify/notifications?userId=carol", &token))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "AUTHORIZATION_ERROR");

    let uri = format!("/api/notify/notifications?userId=bob&token={}", token);
    let (status, _) = app.send(anonymous(&uri)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.send(authed("GET", "/api/notify/notifications?userId=bob", "garbage")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_and_reissue_invalidate_tokens() {
    let app = spawn_app().await;
    let first = app.issue_token("bob").await;
    let second = app.issue_token("bob").await;

    // 重新签发后旧令牌不再是有效会话
    let (status, _) = app.send(authed("GET", "/api/notify/auth/me", &first)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.send(authed("POST", "/api/notify/auth/logout", &second)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.send(authed("GET", "/api/notify/auth/me", &second)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["message"], "Unauthorized");
}

#[tokio::test]
async fn test_stream_rejections() {
    let app = spawn_app().await;
    let token = app.issue_token("bob").await;

    let (status, _) = app.send(anonymous("/api/notify/notifications/stream?userId=bob")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .send(authed("GET", "/api/notify/notifications/stream?userId=carol", &token))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(app.state.hub.active_subscriptions(), 0);
}

/// 把 SSE 文本拆成 (event, data) 对，忽略注释行与不完整的尾部
fn parse_sse(raw: &str) -> Vec<(String, String)> {
    let normalized = raw.replace("\r\n", "\n");
    let mut frames: Vec<&str> = normalized.split("\n\n").collect();
    frames.pop();

    frames
        .into_iter()
        .filter_map(|frame| {
            let mut event = String::from("message");
            let mut data = Vec::new();
            for line in frame.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event = value.trim_start().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push(value.trim_start().to_string());
                }
            }
            (!data.is_empty()).then(|| (event, data.join("\n")))
        })
        .collect()
}

async fn read_until<B>(body: &mut B, received: &mut String, kind: &str) -> Value
where
    B: HttpBody<Data = Bytes> + Unpin,
    B::Error: std::fmt::Debug,
{
    loop {
        if let Some((_, data)) = parse_sse(received).into_iter().find(|(event, _)| event == kind) {
            return serde_json::from_str(&data).unwrap();
        }
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.data())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        received.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[test]
fn test_parse_sse_frames() {
    let raw = "event:connected\ndata:{\"userId\":\"bob\"}\n\n:keep-alive\n\nevent: notification\nid:5\ndata:{}\n\nevent:partial";
    let frames = parse_sse(raw);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].0, "connected");
    assert_eq!(frames[1], ("notification".to_string(), "{}".to_string()));
}

#[tokio::test]
async fn test_stream_delivers_live_notifications() {
    let app = spawn_app().await;
    let token = app.issue_token("bob").await;

    let uri = format!("/api/notify/notifications/stream?userId=bob&token={}", token);
    let response = app.app.clone().oneshot(anonymous(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(app.state.hub.active_subscriptions(), 1);

    let mut body = response.into_body();
    let mut received = String::new();
    let connected = read_until(&mut body, &mut received, "connected").await;
    assert_eq!(connected["userId"], "bob");

    app.comment(9, "alice", "live one").await;

    let notification = read_until(&mut body, &mut received, "notification").await;
    assert_eq!(notification["type"], "COMMENT");
    assert_eq!(notification["senderName"], "Alice");
    assert_eq!(notification["content"], "Alice commented on your post: live one");
    assert_eq!(
        parse_sse(&received)
            .iter()
            .filter(|(event, _)| event == "notification")
            .count(),
        1
    );

    drop(body);
    assert_eq!(app.state.hub.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_invalid_header_falls_back_to_query_token() {
    let app = spawn_app().await;
    let token = app.issue_token("bob").await;

    let uri = format!("/api/notify/notifications?userId=bob&token={}", token);
    let (status, _) = app.send(authed("GET", &uri, "stale-header-token")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = spawn_app().await;
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let response = app.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-123");

    let response = app.app.clone().oneshot(anonymous("/health")).await.unwrap();
    assert!(!response.headers()["x-request-id"].is_empty());
}

#[tokio::test]
async fn test_comment_resolved_through_blog_service() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/internal/users/alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": { "userId": "alice", "displayName": "Alice", "avatarUrl": null }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/internal/posts/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": { "authorId": "bob" }
        })))
        .mount(&server)
        .await;

    let mut config = Config::for_tests();
    config.blog_service_url = Some(server.uri());
    let state = AppState::build(config).await.unwrap();
    assert!(state.http_directory.is_some());

    let request: CommentCreatedRequest = serde_json::from_value(json!({
        "commentId": 1,
        "postId": 7,
        "userId": "alice",
        "content": "no hints attached"
    }))
    .unwrap();
    let sent = state.notification_service.notify_comment_created(&request).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient_id, "bob");
    assert_eq!(sent[0].sender_name, "Alice");
}
