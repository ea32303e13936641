use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::crypto;
use crate::queue::{self, EnqueueOptions, Job};
use crate::signing;
use crate::worker::WorkerCtx;

pub const MAX_ATTEMPTS: i32 = 5;
const RESPONSE_BODY_CAP: usize = 10_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MISSING_SECRET_ERROR: &str = "Endpoint not found or secret missing";

/// Observability schedule for next_retry_at, indexed by attempt number.
/// The substrate does the actual rescheduling; this column only tells
/// dashboards when the next try is expected.
const RETRY_SCHEDULE: [i64; 5] = [30, 120, 600, 3600, 21600];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub delivery_id: Uuid,
    pub endpoint_id: Uuid,
    pub org_id: Uuid,
    pub url: String,
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverOutcome {
    pub success: bool,
    pub status: Option<u16>,
}

/// Create the delivery ledger row and enqueue its job in one transaction.
/// This is the seam the product calls when an event fans out to endpoints.
pub async fn create_delivery(
    conn: &mut PgConnection,
    endpoint_id: Uuid,
    org_id: Uuid,
    url: &str,
    event_id: &str,
    event_type: &str,
    payload: Value,
) -> Result<Uuid> {
    let delivery_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO webhook_deliveries
          (id, endpoint_id, org_id, event_id, event_type, payload)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(delivery_id)
    .bind(endpoint_id)
    .bind(org_id)
    .bind(event_id)
    .bind(event_type)
    .bind(&payload)
    .execute(&mut *conn)
    .await?;

    let job = DeliveryJob {
        delivery_id,
        endpoint_id,
        org_id,
        url: url.to_string(),
        event_id: event_id.to_string(),
        event_type: event_type.to_string(),
        payload,
    };
    queue::enqueue(
        &mut *conn,
        crate::jobs::DELIVER_WEBHOOK,
        serde_json::to_value(&job)?,
        EnqueueOptions {
            max_attempts: Some(MAX_ATTEMPTS),
            ..Default::default()
        },
    )
    .await?;

    Ok(delivery_id)
}

pub async fn run(ctx: &WorkerCtx, job: &Job) -> Result<()> {
    let payload: DeliveryJob =
        serde_json::from_value(job.payload_json.clone()).context("malformed delivery job payload")?;

    let outcome = deliver(ctx, &payload, job.attempt).await?;
    if outcome.success {
        tracing::info!(
            delivery_id=%payload.delivery_id,
            status=?outcome.status,
            attempt=job.attempt,
            "webhook delivered"
        );
    }
    Ok(())
}

/// One signed delivery attempt. The ledger row is updated before any error
/// is returned, so a crash right after never loses the attempt's outcome.
pub async fn deliver(
    ctx: &WorkerCtx,
    job: &DeliveryJob,
    attempt_number: i32,
) -> Result<DeliverOutcome> {
    let secret = match load_signing_secret(ctx, job.endpoint_id).await? {
        Some(secret) => secret,
        None => {
            // misconfiguration, not a transient fault: record a terminal
            // failure without consuming the substrate's retry budget
            let mut stx = ctx.svc.begin("deliver_webhook").await?;
            sqlx::query(
                r#"
                UPDATE webhook_deliveries
                SET attempt_number = $2,
                    error = $3,
                    failed_at = now(),
                    next_retry_at = NULL,
                    updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(job.delivery_id)
            .bind(attempt_number)
            .bind(MISSING_SECRET_ERROR)
            .execute(&mut *stx)
            .await?;
            stx.commit().await?;

            tracing::error!(
                delivery_id=%job.delivery_id,
                endpoint_id=%job.endpoint_id,
                "cannot sign delivery: endpoint not found or secret missing"
            );
            return Ok(DeliverOutcome {
                success: false,
                status: None,
            });
        }
    };

    // bytes signed == bytes sent
    let body = serde_json::to_string(&job.payload).map_err(|e| anyhow!("payload serialize: {e}"))?;
    let ts = Utc::now().timestamp();
    let signature_header = signing::signature_header(&secret, ts, &body);

    tracing::info!(
        delivery_id=%job.delivery_id,
        event_id=%job.event_id,
        attempt=attempt_number,
        endpoint=%job.url,
        "sending webhook (signed)"
    );

    let resp = ctx
        .http
        .post(&job.url)
        .header("Content-Type", "application/json")
        .header(signing::WEBHOOK_ID_HEADER, &job.event_id)
        .header(signing::WEBHOOK_TIMESTAMP_HEADER, ts.to_string())
        .header(signing::WEBHOOK_SIGNATURE_HEADER, signature_header)
        .header("User-Agent", signing::USER_AGENT)
        .body(body)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await;

    match resp {
        Ok(r) if r.status().is_success() => {
            let status = r.status().as_u16();
            let headers = headers_to_json(r.headers());
            let body = truncate_body(&r.text().await.unwrap_or_default());

            let mut stx = ctx.svc.begin("deliver_webhook").await?;
            sqlx::query(
                r#"
                UPDATE webhook_deliveries
                SET attempt_number = $2,
                    response_status = $3,
                    response_body = $4,
                    response_headers = $5,
                    delivered_at = now(),
                    error = NULL,
                    failed_at = NULL,
                    next_retry_at = NULL,
                    updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(job.delivery_id)
            .bind(attempt_number)
            .bind(status as i32)
            .bind(body)
            .bind(headers)
            .execute(&mut *stx)
            .await?;
            stx.commit().await?;

            Ok(DeliverOutcome {
                success: true,
                status: Some(status),
            })
        }
        Ok(r) => {
            let status = r.status().as_u16();
            let headers = headers_to_json(r.headers());
            let body = truncate_body(&r.text().await.unwrap_or_default());

            record_failed_attempt(
                ctx,
                job,
                attempt_number,
                Some(status as i32),
                Some(body),
                Some(headers),
                &format!("HTTP {status}"),
            )
            .await?;

            Err(anyhow!("Webhook returned {status}"))
        }
        Err(e) => {
            let message = if e.is_timeout() {
                "Request timeout".to_string()
            } else {
                e.to_string()
            };

            record_failed_attempt(ctx, job, attempt_number, None, None, None, &message).await?;

            Err(anyhow!(message))
        }
    }
}

async fn load_signing_secret(ctx: &WorkerCtx, endpoint_id: Uuid) -> Result<Option<String>> {
    let mut stx = ctx.svc.begin("deliver_webhook").await?;
    let stored: Option<String> =
        sqlx::query_scalar("SELECT secret FROM webhook_endpoints WHERE id = $1")
            .bind(endpoint_id)
            .fetch_optional(&mut *stx)
            .await?;
    stx.commit().await?;

    let Some(stored) = stored else {
        return Ok(None);
    };
    if stored.trim().is_empty() {
        return Ok(None);
    }

    match crypto::resolve_stored_secret(ctx.secret_cipher.as_ref(), &stored) {
        Ok(secret) => Ok(Some(secret)),
        Err(e) => {
            tracing::error!(%endpoint_id, error=%e, "failed to resolve endpoint secret");
            Ok(None)
        }
    }
}

async fn record_failed_attempt(
    ctx: &WorkerCtx,
    job: &DeliveryJob,
    attempt_number: i32,
    response_status: Option<i32>,
    response_body: Option<String>,
    response_headers: Option<Value>,
    error: &str,
) -> Result<()> {
    let exhausted = attempt_number >= MAX_ATTEMPTS;
    let next_retry_at = if exhausted {
        None
    } else {
        Some(Utc::now() + chrono::Duration::seconds(retry_delay_secs(attempt_number)))
    };
    let failed_at = if exhausted { Some(Utc::now()) } else { None };

    let mut stx = ctx.svc.begin("deliver_webhook").await?;
    sqlx::query(
        r#"
        UPDATE webhook_deliveries
        SET attempt_number = $2,
            response_status = $3,
            response_body = $4,
            response_headers = $5,
            error = $6,
            failed_at = $7,
            next_retry_at = $8,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job.delivery_id)
    .bind(attempt_number)
    .bind(response_status)
    .bind(response_body)
    .bind(response_headers)
    .bind(error)
    .bind(failed_at)
    .bind(next_retry_at)
    .execute(&mut *stx)
    .await?;
    stx.commit().await?;

    if exhausted {
        tracing::warn!(
            delivery_id=%job.delivery_id,
            endpoint_id=%job.endpoint_id,
            attempts=attempt_number,
            "webhook endpoint exhausted delivery attempts"
        );
    }

    Ok(())
}

/// Backoff table position for an attempt; the last entry repeats for any
/// attempt past the end.
fn retry_delay_secs(attempt_number: i32) -> i64 {
    let idx = ((attempt_number - 1).max(0) as usize).min(RETRY_SCHEDULE.len() - 1);
    RETRY_SCHEDULE[idx]
}

fn truncate_body(body: &str) -> String {
    if body.len() <= RESPONSE_BODY_CAP {
        return body.to_string();
    }
    body.chars().take(RESPONSE_BODY_CAP).collect()
}

fn headers_to_json(headers: &reqwest::header::HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        map.insert(
            name.as_str().to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }
    Value::Object(map)
}
