use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

/// 存活检查，附带键值存储连通性
/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let store_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Health check: key-value store unreachable: {}", e);
            false
        }
    };

    let status = if store_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "success": store_ok,
            "service": "rainbow-notify",
            "version": env!("CARGO_PKG_VERSION"),
            "store": if store_ok { "up" } else { "down" },
            "connectedRecipients": state.hub.connected_recipients(),
        })),
    )
}
