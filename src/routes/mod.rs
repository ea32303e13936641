use axum::routing::get;
use axum::Router;

use crate::state::AppState;

mod health;
mod metrics;

pub fn router(state: AppState) -> Router<()> {
    Router::<AppState>::new()
        .merge(health::routes())
        .route("/metrics", get(metrics::get_metrics))
        .with_state(state)
}
