use crate::{
    error::AppError,
    models::auth::Principal,
    services::gateway::{candidate_tokens, Authenticated},
    state::AppState,
};
use axum::{
    body::Body,
    extract::{FromRequestParts, Query},
    headers::{authorization::Bearer, Authorization, HeaderMapExt},
    http::{request::Parts, HeaderMap, HeaderValue, Request, Uri},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// 收集 `Authorization: Bearer` 头与 `token` 查询参数中的令牌，头部优先
pub fn extract_tokens(headers: &HeaderMap, uri: &Uri) -> Vec<String> {
    let bearer = headers.typed_get::<Authorization<Bearer>>();
    let header = bearer.as_ref().map(|Authorization(bearer)| bearer.token());
    let query = Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.token);

    candidate_tokens(header, query.as_deref())
}

/// 已认证用户提取器，校验失败时返回 401
pub struct AuthUser {
    pub principal: Principal,
    pub token: String,
}

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let candidates = extract_tokens(&parts.headers, &parts.uri);
        let Authenticated { principal, token } = state.gateway.authenticate(&candidates).await?;
        debug!("Authenticated request to {} for {}", parts.uri.path(), principal.subject);

        Ok(AuthUser { principal, token })
    }
}

/// 服务间调用的共享令牌校验
pub struct InternalCaller;

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for InternalCaller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let expected = state.config.internal_api_token.as_str();
        let presented = parts
            .headers
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());

        match presented {
            Some(token) if !expected.is_empty() && token == expected => Ok(InternalCaller),
            _ => {
                warn!("Rejected internal call to {}", parts.uri.path());
                Err(AppError::unauthorized("invalid internal token"))
            }
        }
    }
}

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// 请求 ID 中间件：沿用上游传入的ID，否则生成新的；处理过程的日志都带上该ID
pub async fn request_id_middleware(request: Request<Body>, next: Next<Body>) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
