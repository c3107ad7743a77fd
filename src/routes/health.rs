use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;

use crate::{state::AppState, workers::health::database_reachable};

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let database = match state.db() {
        Ok(mut conn) => database_reachable(&mut conn),
        Err(_) => false,
    };
    let database = if database { "ok" } else { "error" };
    (StatusCode::OK, Json(json!({ "status": "ok", "database": database })))
}
