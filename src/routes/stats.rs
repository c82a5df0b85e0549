use crate::{error::Result, state::AppState, utils::middleware::InternalCaller};
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_stats))
}

/// 运行时计数
/// GET /api/notify/stats
async fn get_stats(State(state): State<Arc<AppState>>, _internal: InternalCaller) -> Result<Json<Value>> {
    debug!("Collecting notification stats");

    Ok(Json(json!({
        "success": true,
        "data": {
            "hub": state.hub.stats(),
            "publisher": state.publisher.stats(),
            "eventLog": {
                "partitions": state.event_log.partitions(),
            },
            "memoryStoreKeys": state.memory_store.as_ref().map(|store| store.len()),
        }
    })))
}
