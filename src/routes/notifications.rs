use crate::{
    error::{AppError, Result},
    models::notification::{HistoryQuery, NotificationPayload, RecipientQuery},
    services::gateway::StreamGateway,
    state::AppState,
    utils::middleware::{extract_tokens, AuthUser},
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_unread_notifications))
        .route("/all", get(get_all_notifications))
        .route("/stream", get(stream_notifications))
        .route("/:id/read", post(mark_as_read))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    user_id: Option<String>,
}

/// 订阅实时通知（SSE）
/// GET /api/notify/notifications/stream?userId=&token=
async fn stream_notifications(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response> {
    let candidates = extract_tokens(&headers, &uri);
    let session = state
        .gateway
        .open(&candidates, query.user_id.as_deref())
        .await?;

    Ok(state.gateway.sse(session).into_response())
}

/// 未读通知快照
/// GET /api/notify/notifications?userId=&limit=
async fn get_unread_notifications(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>> {
    StreamGateway::authorize(&auth.principal, Some(&query.user_id))?;

    let limit = query
        .limit
        .unwrap_or(state.config.default_history_limit)
        .clamp(1, state.history.capacity());
    let notifications: Vec<NotificationPayload> = state
        .history
        .list_unread(&query.user_id, limit)
        .await
        .iter()
        .map(NotificationPayload::from)
        .collect();

    debug!("Returning {} unread notifications for {}", notifications.len(), query.user_id);
    Ok(Json(json!({
        "success": true,
        "data": notifications
    })))
}

/// 全部最近通知（带已读标记）
/// GET /api/notify/notifications/all?userId=
async fn get_all_notifications(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<RecipientQuery>,
) -> Result<Json<Value>> {
    StreamGateway::authorize(&auth.principal, Some(&query.user_id))?;

    let notifications: Vec<NotificationPayload> = state
        .history
        .list(&query.user_id)
        .await
        .iter()
        .map(NotificationPayload::from)
        .collect();

    Ok(Json(json!({
        "success": true,
        "data": notifications
    })))
}

/// 标记已读（幂等）
/// POST /api/notify/notifications/:id/read?userId=
async fn mark_as_read(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(notification_id): Path<String>,
    Query(query): Query<RecipientQuery>,
) -> Result<Json<Value>> {
    StreamGateway::authorize(&auth.principal, Some(&query.user_id))?;

    let notification_id: i64 = notification_id
        .parse()
        .map_err(|_| AppError::bad_request("Invalid notification id"))?;
    state.read_state.mark_read(&query.user_id, notification_id).await;

    Ok(Json(json!({
        "success": true,
        "message": "Notification marked as read"
    })))
}
