use anyhow::Result;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use uuid::Uuid;

const KEY_PREFIX: &str = "metric";

/// Fast ephemeral counters written by request-path instrumentation, keyed
/// `metric:{org_id}:{YYYY-MM-DD-HH}`. The store is a disposable cache: once
/// aggregation lands a counter in usage_records, the key is deleted.
#[derive(Clone)]
pub struct CounterStore {
    client: redis::Client,
}

impl CounterStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub async fn connect(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

pub fn counter_key(org_id: Uuid, bucket: &str) -> String {
    format!("{KEY_PREFIX}:{org_id}:{bucket}")
}

/// `metric:{org_id}:{bucket}` → org id. Anything else is a malformed key.
pub fn parse_counter_key(key: &str) -> Option<Uuid> {
    let mut parts = key.splitn(3, ':');
    if parts.next()? != KEY_PREFIX {
        return None;
    }
    let org = parts.next()?;
    parts.next()?;
    Uuid::parse_str(org).ok()
}

/// Hour-bucket partition key, `YYYY-MM-DD-HH` in UTC.
pub fn hour_bucket(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d-%H").to_string()
}

/// Start of the hour a bucket names.
pub fn parse_hour_bucket(bucket: &str) -> Option<DateTime<Utc>> {
    let (date_part, hour_part) = bucket.rsplit_once('-')?;
    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    let hour: u32 = hour_part.parse().ok()?;
    let naive = date.and_hms_opt(hour, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

pub async fn scan_bucket_keys(conn: &mut MultiplexedConnection, bucket: &str) -> Result<Vec<String>> {
    let pattern = format!("{KEY_PREFIX}:*:{bucket}");

    // drain the cursor before reusing the connection for GET/DEL
    let mut keys = Vec::new();
    let mut iter: redis::AsyncIter<'_, String> = conn.scan_match(&pattern).await?;
    while let Some(key) = iter.next_item().await {
        keys.push(key);
    }

    Ok(keys)
}

/// Missing keys read as zero.
pub async fn get_counter(conn: &mut MultiplexedConnection, key: &str) -> Result<i64> {
    let value: Option<i64> = conn.get(key).await?;
    Ok(value.unwrap_or(0))
}

pub async fn delete_counter(conn: &mut MultiplexedConnection, key: &str) -> Result<()> {
    let _: () = conn.del(key).await?;
    Ok(())
}
