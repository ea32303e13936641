use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    // uses ./migrations at compile time
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub fn connect_redis(redis_url: &str) -> Result<redis::Client> {
    redis::Client::open(redis_url).context("invalid REDIS_URL")
}
