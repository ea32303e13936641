use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

use conveyor::counters::CounterStore;
use conveyor::worker::WorkerCtx;
use conveyor::{config, db, routes, scheduler, state, worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load .env (local dev)
    dotenvy::dotenv().ok();

    // Config
    let cfg = config::Config::from_env()?;
    tracing::info!(host=%cfg.host, port=cfg.port, "config loaded");
    if cfg.secrets_key.is_none() {
        tracing::warn!("SECRETS_KEY is not set; endpoint secrets are stored and read as plaintext");
    }
    if cfg.stripe_secret_key.is_none() {
        tracing::warn!("STRIPE_SECRET_KEY is not set; usage reporting will be skipped");
    }

    // DB + counter store

    let pool: PgPool = db::connect(&cfg.database_url).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("db connected + migrations applied");

    let counters = CounterStore::new(db::connect_redis(&cfg.redis_url)?);

    // Workers + scheduler
    let ctx = WorkerCtx::new(pool.clone(), counters.clone(), &cfg)?;
    worker::spawn_worker_pools(&ctx, &cfg);
    tokio::spawn(scheduler::run_scheduler(ctx));

    // Ops routes
    let state = state::AppState { pool, counters };
    let app = routes::router(state);

    // Serve
    let addr = cfg.bind_addr();
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
