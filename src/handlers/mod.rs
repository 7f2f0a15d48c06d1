pub mod auth;
pub mod drivers;
pub mod fares;
pub mod rides;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.sessions.connection_count(),
        "indexedDrivers": state.geo.len(),
    }))
}
