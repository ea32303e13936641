use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::<AppState>::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();
    let counters_ok = state.counters.ping().await.is_ok();

    if db_ok && counters_ok {
        (
            StatusCode::OK,
            Json(json!({ "ok": true, "db": "ok", "counter_store": "ok" })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "ok": false,
                "db": if db_ok { "ok" } else { "down" },
                "counter_store": if counters_ok { "ok" } else { "down" },
            })),
        )
    }
}
