use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::config::Route;
use crate::state::AppState;

/// Route listing handler for `GET /api/routes`.
/// Returns the live routing table in file order.
pub fn handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.routes_snapshot();
    let routes: Vec<&Route> = snapshot.iter().map(Arc::as_ref).collect();
    Json(json!({
        "count": routes.len(),
        "routes": routes,
    }))
}
