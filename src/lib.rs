pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;

use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use crate::{config::Config, error::AppError, state::AppState};

/// 构建完整的 HTTP 应用，使用 /api/notify/ 前缀避免网关路由冲突
pub fn build_router(state: Arc<AppState>) -> Router {
    let origins = state
        .config
        .cors_allowed_origins
        .split(',')
        .filter_map(|origin| origin.trim().parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(origins);

    Router::new()
        .route("/", get(routes::health::health_check))
        .route("/health", get(routes::health::health_check))
        .route("/api/notify/health", get(routes::health::health_check))
        .nest("/api/notify/notifications", routes::notifications::router())
        .nest("/api/notify/auth", routes::auth::router())
        .nest("/api/notify/events", routes::events::router())
        .nest("/api/notify/stats", routes::stats::router())
        .layer(middleware::from_fn(utils::middleware::request_id_middleware))
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
