use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Service status handler for `GET /api`.
/// Reports liveness plus a summary of the active configuration.
pub fn handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "responsify-rs is running",
        "config": {
            "routes_count": state.route_count(),
            "routes_file": config.routing.routes_file,
            "watch_routes_file": config.routing.watch,
            "client_authentication": {
                "ip_whitelist_rules": config.client_authentication.ip_whitelist.len(),
                "token_auth": config.client_authentication.token_key.is_some(),
            },
            "features": {
                "log_level": config.features.log_level,
                "access_log": config.features.access_log,
            }
        }
    }))
}
