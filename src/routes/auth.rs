use crate::{
    error::Result,
    models::auth::IssueTokenRequest,
    state::AppState,
    utils::middleware::{AuthUser, InternalCaller},
};
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use validator::Validate;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/token", post(issue_token))
        .route("/logout", post(logout))
        .route("/me", get(get_current_principal))
}

/// 签发令牌
/// POST /api/notify/auth/token
///
/// 登录流程在主服务完成密码校验后调用，需要服务间令牌。
async fn issue_token(
    State(state): State<Arc<AppState>>,
    _internal: InternalCaller,
    Json(request): Json<IssueTokenRequest>,
) -> Result<Json<Value>> {
    request.validate()?;

    let issued = state
        .token_authority
        .issue(&request.subject, &request.authorities)
        .await?;

    Ok(Json(json!({
        "success": true,
        "data": issued
    })))
}

/// 登出，吊销当前令牌
/// POST /api/notify/auth/logout
async fn logout(State(state): State<Arc<AppState>>, auth: AuthUser) -> Result<Json<Value>> {
    state.token_authority.revoke(&auth.token).await?;
    info!("User {} logged out", auth.principal.subject);

    Ok(Json(json!({
        "success": true,
        "message": "Logged out"
    })))
}

/// 当前令牌对应的身份
/// GET /api/notify/auth/me
async fn get_current_principal(auth: AuthUser) -> Result<Json<Value>> {
    debug!("Getting principal for {}", auth.principal.subject);

    Ok(Json(json!({
        "success": true,
        "data": auth.principal
    })))
}
