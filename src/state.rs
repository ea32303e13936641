use sqlx::PgPool;

use crate::counters::CounterStore;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub counters: CounterStore,
}
