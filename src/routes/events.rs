use crate::{
    error::Result,
    models::{
        comment::{CommentCreatedRequest, PostLikedRequest},
        notification::{NotificationPayload, SystemNotificationRequest},
    },
    state::AppState,
    utils::middleware::InternalCaller,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use validator::Validate;

/// 主服务回调的业务事件入口，均需要服务间令牌
///
/// 请求体合法时总是返回 202，通知是否真正发出不影响响应。
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/comments", post(comment_created))
        .route("/likes", post(post_liked))
        .route("/system", post(system_notification))
}

/// POST /api/notify/events/comments
async fn comment_created(
    State(state): State<Arc<AppState>>,
    _internal: InternalCaller,
    Json(request): Json<CommentCreatedRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    request.validate()?;

    let sent: Vec<NotificationPayload> = state
        .notification_service
        .notify_comment_created(&request)
        .await
        .iter()
        .map(NotificationPayload::from)
        .collect();

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "data": sent
        })),
    ))
}

/// POST /api/notify/events/likes
async fn post_liked(
    State(state): State<Arc<AppState>>,
    _internal: InternalCaller,
    Json(request): Json<PostLikedRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    request.validate()?;

    let sent = state
        .notification_service
        .notify_post_liked(&request)
        .await
        .map(|event| event.payload());

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "data": sent
        })),
    ))
}

/// POST /api/notify/events/system
async fn system_notification(
    State(state): State<Arc<AppState>>,
    _internal: InternalCaller,
    Json(request): Json<SystemNotificationRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    request.validate()?;

    let sent = state
        .notification_service
        .send_system_notification(&request.recipient_id, &request.content)
        .await
        .map(|event| event.payload());

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "data": sent
        })),
    ))
}
