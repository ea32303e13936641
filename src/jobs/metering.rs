use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::counters;
use crate::queue::Job;
use crate::stripe;
use crate::worker::WorkerCtx;

const METRIC_API_CALLS: &str = "api_calls";
const METRIC_ACTIVE_SEATS: &str = "active_seats";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateJob {
    pub hour_bucket: Option<String>,
}

/// Payload for both daily jobs; an absent date means "the job's default day".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatedJob {
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOutcome {
    pub processed_keys: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub processed_orgs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOutcome {
    pub reported_orgs: usize,
}

pub async fn run_aggregate(ctx: &WorkerCtx, job: &Job) -> Result<()> {
    let payload: AggregateJob = serde_json::from_value(job.payload_json.clone())
        .context("malformed aggregation job payload")?;
    let outcome = aggregate(ctx, payload.hour_bucket.as_deref()).await?;
    tracing::info!(processed_keys = outcome.processed_keys, "usage aggregation finished");
    Ok(())
}

pub async fn run_snapshot(ctx: &WorkerCtx, job: &Job) -> Result<()> {
    let payload: DatedJob = serde_json::from_value(job.payload_json.clone())
        .context("malformed seat snapshot job payload")?;
    let outcome = snapshot(ctx, payload.date).await?;
    tracing::info!(processed_orgs = outcome.processed_orgs, "seat snapshot finished");
    Ok(())
}

pub async fn run_report(ctx: &WorkerCtx, job: &Job) -> Result<()> {
    let payload: DatedJob = serde_json::from_value(job.payload_json.clone())
        .context("malformed usage report job payload")?;
    let outcome = report(ctx, payload.date).await?;
    tracing::info!(reported_orgs = outcome.reported_orgs, "usage reporting finished");
    Ok(())
}

/// Flush hourly counters from the counter store into usage_records.
///
/// Counts every scanned key, including ones whose flush failed; failures
/// stay in the store and are retried on the next tick.
pub async fn aggregate(ctx: &WorkerCtx, hour_bucket: Option<&str>) -> Result<AggregateOutcome> {
    let bucket = match hour_bucket {
        Some(b) => b.to_string(),
        None => counters::hour_bucket(Utc::now() - Duration::hours(1)),
    };
    let Some(period_start) = counters::parse_hour_bucket(&bucket) else {
        bail!("invalid hour bucket: {bucket}");
    };
    let period_end = period_start + Duration::hours(1);

    let mut conn = ctx.counters.connect().await?;
    let keys = counters::scan_bucket_keys(&mut conn, &bucket).await?;

    for key in &keys {
        if let Err(e) = flush_counter_key(ctx, &mut conn, key, period_start, period_end).await {
            tracing::error!(key, error=%format!("{e:#}"), "failed to flush counter key");
        }
    }

    Ok(AggregateOutcome {
        processed_keys: keys.len(),
    })
}

async fn flush_counter_key(
    ctx: &WorkerCtx,
    conn: &mut redis::aio::MultiplexedConnection,
    key: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Result<()> {
    let Some(org_id) = counters::parse_counter_key(key) else {
        tracing::warn!(key, "skipping malformed counter key");
        return Ok(());
    };

    let quantity = counters::get_counter(conn, key).await?;
    if quantity <= 0 {
        return Ok(());
    }

    let mut stx = ctx.svc.begin("aggregate_usage").await?;
    upsert_usage_record(
        &mut stx,
        org_id,
        METRIC_API_CALLS,
        period_start,
        period_end,
        quantity,
    )
    .await?;
    stx.commit().await?;

    // the window between commit and DEL can double-count on a crash;
    // accepted at-least-once behavior
    counters::delete_counter(conn, key).await?;

    tracing::debug!(%org_id, key, quantity, "flushed counter into usage record");
    Ok(())
}

/// Record member headcount per organization for the day.
pub async fn snapshot(ctx: &WorkerCtx, date: Option<NaiveDate>) -> Result<SnapshotOutcome> {
    let date = date.unwrap_or_else(|| Utc::now().date_naive());
    let period_start = start_of_day(date);
    let period_end = period_start + Duration::days(1);

    let org_ids: Vec<(Uuid,)> = {
        let mut stx = ctx.svc.begin("snapshot_active_seats").await?;
        let rows = sqlx::query_as("SELECT id FROM organizations ORDER BY created_at")
            .fetch_all(&mut *stx)
            .await?;
        stx.commit().await?;
        rows
    };

    let mut processed_orgs = 0;
    for (org_id,) in org_ids {
        match snapshot_org(ctx, org_id, period_start, period_end).await {
            Ok(seats) => {
                processed_orgs += 1;
                tracing::debug!(%org_id, seats, "recorded seat snapshot");
            }
            Err(e) => {
                tracing::error!(%org_id, error=%format!("{e:#}"), "seat snapshot failed for org");
            }
        }
    }

    Ok(SnapshotOutcome { processed_orgs })
}

async fn snapshot_org(
    ctx: &WorkerCtx,
    org_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Result<i64> {
    let mut stx = ctx.svc.begin("snapshot_active_seats").await?;

    let (seats,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM organization_members WHERE org_id = $1")
            .bind(org_id)
            .fetch_one(&mut *stx)
            .await?;

    upsert_usage_record(
        &mut stx,
        org_id,
        METRIC_ACTIVE_SEATS,
        period_start,
        period_end,
        seats,
    )
    .await?;

    stx.commit().await?;
    Ok(seats)
}

/// Push the day's unreported api_calls usage to the billing provider, one
/// meter event per org, and mark the contributing rows reported.
pub async fn report(ctx: &WorkerCtx, date: Option<NaiveDate>) -> Result<ReportOutcome> {
    let Some(secret_key) = ctx.stripe_secret_key.as_deref() else {
        tracing::warn!("STRIPE_SECRET_KEY is not set, skipping usage reporting");
        return Ok(ReportOutcome { reported_orgs: 0 });
    };

    let date = date.unwrap_or_else(|| (Utc::now() - Duration::days(1)).date_naive());
    let period_start = start_of_day(date);
    let period_end = period_start + Duration::days(1);

    let totals: Vec<(Uuid, i64, Vec<Uuid>)> = {
        let mut stx = ctx.svc.begin("report_usage").await?;
        let rows = sqlx::query_as(
            r#"
            SELECT org_id, SUM(quantity)::BIGINT, ARRAY_AGG(id)
            FROM usage_records
            WHERE metric_type = $1
              AND reported_to_stripe = FALSE
              AND period_start >= $2
              AND period_start < $3
            GROUP BY org_id
            "#,
        )
        .bind(METRIC_API_CALLS)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&mut *stx)
        .await?;
        stx.commit().await?;
        rows
    };

    let mut reported_orgs = 0;
    for (org_id, quantity, row_ids) in totals {
        match report_org(ctx, secret_key, org_id, quantity, &row_ids, period_end).await {
            Ok(true) => reported_orgs += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(%org_id, error=%format!("{e:#}"), "usage reporting failed for org");
            }
        }
    }

    Ok(ReportOutcome { reported_orgs })
}

async fn report_org(
    ctx: &WorkerCtx,
    secret_key: &str,
    org_id: Uuid,
    quantity: i64,
    row_ids: &[Uuid],
    period_end: DateTime<Utc>,
) -> Result<bool> {
    let mut stx = ctx.svc.begin("report_usage").await?;

    let subscription: Option<(Option<String>, String)> = sqlx::query_as(
        r#"
        SELECT s.external_price_id, bc.external_customer_id
        FROM subscriptions s
        JOIN billing_customers bc ON bc.org_id = s.org_id
        WHERE s.org_id = $1 AND s.status IN ('active', 'trialing')
        ORDER BY s.created_at DESC
        LIMIT 1
        "#,
    )
    .bind(org_id)
    .fetch_optional(&mut *stx)
    .await?;

    let Some((price_id, external_customer_id)) = subscription else {
        tracing::debug!(%org_id, "no active subscription, skipping usage report");
        return Ok(false);
    };
    let metered = price_id
        .as_deref()
        .map(|p| ctx.plan_map.is_metered(p))
        .unwrap_or(false);
    if !metered {
        tracing::debug!(%org_id, "subscription price is not metered, skipping usage report");
        return Ok(false);
    }

    let event = stripe::MeterEvent {
        event_name: ctx.meter_event_name.clone(),
        payload: stripe::MeterEventPayload {
            stripe_customer_id: external_customer_id,
            value: quantity,
        },
        timestamp: period_end.timestamp(),
    };
    stripe::report_meter_event(&ctx.http, &ctx.stripe_api_base, secret_key, &event).await?;

    // mark exactly the rows the sum covered; anything landing mid-report
    // stays unreported
    let external_usage_record_id = format!("mtr_{}", Uuid::new_v4());
    sqlx::query(
        r#"
        UPDATE usage_records
        SET reported_to_stripe = TRUE,
            external_usage_record_id = $2,
            reported_at = now(),
            updated_at = now()
        WHERE id = ANY($1)
        "#,
    )
    .bind(row_ids)
    .bind(&external_usage_record_id)
    .execute(&mut *stx)
    .await?;

    stx.commit().await?;
    tracing::info!(%org_id, quantity, external_usage_record_id, "reported usage to billing provider");
    Ok(true)
}

/// Insert or overwrite the usage row for one (org, metric, period).
///
/// usage_records has no unique index on this triple, so uniqueness is
/// maintained here: check inside the caller's transaction, then update or
/// insert. Quantity overwrites rather than accumulates.
pub async fn upsert_usage_record(
    conn: &mut PgConnection,
    org_id: Uuid,
    metric_type: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    quantity: i64,
) -> Result<Uuid> {
    let existing: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM usage_records
        WHERE org_id = $1 AND metric_type = $2 AND period_start = $3
        LIMIT 1
        "#,
    )
    .bind(org_id)
    .bind(metric_type)
    .bind(period_start)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((id,)) = existing {
        sqlx::query("UPDATE usage_records SET quantity = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(quantity)
            .execute(&mut *conn)
            .await?;
        return Ok(id);
    }

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO usage_records (id, org_id, metric_type, period_start, period_end, quantity)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(id)
    .bind(org_id)
    .bind(metric_type)
    .bind(period_start)
    .bind(period_end)
    .bind(quantity)
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}
