use anyhow::{anyhow, Context, Result};

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    pub secrets_key: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_api_base: String,
    pub meter_event_name: String,
    pub plan_price_map: String,
    pub metered_price_ids: String,
    pub delivery_workers: usize,
    pub ingest_workers: usize,
    pub metering_workers: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // pulls from OS env; .env will be loaded in main
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is missing")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is missing")?;

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|e| anyhow!("PORT must be a valid u16: {e}"))?;

        let secrets_key = std::env::var("SECRETS_KEY").ok().filter(|v| !v.is_empty());
        let stripe_secret_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|v| !v.is_empty());

        let stripe_api_base = std::env::var("STRIPE_API_BASE")
            .unwrap_or_else(|_| "https://api.stripe.com".to_string());

        let meter_event_name =
            std::env::var("METER_EVENT_NAME").unwrap_or_else(|_| "api_calls".to_string());

        let plan_price_map = std::env::var("PLAN_PRICE_MAP").unwrap_or_default();
        let metered_price_ids = std::env::var("METERED_PRICE_IDS").unwrap_or_default();

        let delivery_workers = parse_worker_count("DELIVERY_WORKERS", 4)?;
        let ingest_workers = parse_worker_count("INGEST_WORKERS", 2)?;
        let metering_workers = parse_worker_count("METERING_WORKERS", 1)?;

        Ok(Self {
            database_url,
            redis_url,
            host,
            port,
            secrets_key,
            stripe_secret_key,
            stripe_api_base,
            meter_event_name,
            plan_price_map,
            metered_price_ids,
            delivery_workers,
            ingest_workers,
            metering_workers,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_worker_count(var: &str, default: usize) -> Result<usize> {
    let n: usize = std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|e| anyhow!("{var} must be a valid count: {e}"))?;
    if n == 0 {
        return Err(anyhow!("{var} must be at least 1"));
    }
    Ok(n)
}
