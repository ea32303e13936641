use chrono::{Duration, NaiveTime, TimeZone, Utc};
use serde_json::json;

use crate::counters;
use crate::jobs;
use crate::queue::{self, EnqueueOptions};
use crate::worker::WorkerCtx;

const TICK_SECONDS: u64 = 60;

/// Enqueue the periodic metering jobs. Dedup keys carry the period, so any
/// number of concurrent schedulers enqueue each period exactly once and a
/// tick is free to repeat.
pub async fn run_scheduler(ctx: WorkerCtx) {
    tracing::info!(tick_seconds = TICK_SECONDS, "scheduler started");

    loop {
        if let Err(e) = tick(&ctx).await {
            tracing::error!(error=%format!("{e:#}"), "scheduler tick failed");
        }
        tokio::time::sleep(std::time::Duration::from_secs(TICK_SECONDS)).await;
    }
}

/// One scheduler pass. `run_scheduler` loops this every minute.
pub async fn tick(ctx: &WorkerCtx) -> anyhow::Result<()> {
    let now = Utc::now();

    let hour_bucket = counters::hour_bucket(now - Duration::hours(1));
    queue::enqueue(
        &ctx.pool,
        jobs::AGGREGATE_USAGE,
        json!({ "hour_bucket": hour_bucket }),
        EnqueueOptions {
            dedup_key: Some(format!("{}:{hour_bucket}", jobs::AGGREGATE_USAGE)),
            ..Default::default()
        },
    )
    .await?;

    let today = now.date_naive();
    queue::enqueue(
        &ctx.pool,
        jobs::SNAPSHOT_ACTIVE_SEATS,
        json!({ "date": today }),
        EnqueueOptions {
            dedup_key: Some(format!("{}:{today}", jobs::SNAPSHOT_ACTIVE_SEATS)),
            ..Default::default()
        },
    )
    .await?;

    // yesterday's 23:00 bucket is flushed by the first aggregation after
    // midnight; hold the report until 01:00 so its totals see that flush
    let yesterday = (now - Duration::days(1)).date_naive();
    let report_at = Utc.from_utc_datetime(&today.and_time(NaiveTime::MIN)) + Duration::hours(1);
    queue::enqueue(
        &ctx.pool,
        jobs::REPORT_USAGE,
        json!({ "date": yesterday }),
        EnqueueOptions {
            run_at: Some(report_at),
            dedup_key: Some(format!("{}:{yesterday}", jobs::REPORT_USAGE)),
            ..Default::default()
        },
    )
    .await?;

    Ok(())
}
