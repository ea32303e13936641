use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

const BASE_DELAY_SECS: i64 = 10;
const CAP_DELAY_SECS: i64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload_json: Value,
    pub attempt: i32,
    pub max_attempts: i32,
}

#[derive(Debug, Default, Clone)]
pub struct EnqueueOptions {
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
    /// Unique across all jobs; a second enqueue with the same key returns
    /// the existing job instead of inserting. Used by the periodic
    /// scheduler so each period is enqueued once per fleet.
    pub dedup_key: Option<String>,
}

/// Insert a job into a named queue. Works on a pool or inside an open
/// transaction, so handlers can fan out jobs atomically with their writes.
pub async fn enqueue<'e, E>(
    db: E,
    queue: &str,
    payload: Value,
    opts: EnqueueOptions,
) -> Result<Uuid>
where
    E: sqlx::PgExecutor<'e>,
{
    let run_at = opts.run_at.unwrap_or_else(Utc::now);
    let max_attempts = opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);

    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO jobs (id, queue, payload_json, status, run_at, max_attempts, dedup_key)
        VALUES ($1, $2, $3, 'queued'::job_status, $4, $5, $6)
        ON CONFLICT (dedup_key)
        DO UPDATE SET dedup_key = jobs.dedup_key
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(queue)
    .bind(payload)
    .bind(run_at)
    .bind(max_attempts)
    .bind(opts.dedup_key)
    .fetch_one(db)
    .await?;

    Ok(id)
}

/// Lease ONE job from a queue safely.
///
/// Key idea:
/// - Pick one job that is runnable:
///   - status = queued AND run_at <= now()
///   - OR status = running but lock has expired (worker crashed)
/// - Lock row with `FOR UPDATE SKIP LOCKED`
/// - Update it to running and set lock_expires_at
pub async fn lease_one(
    pool: &PgPool,
    queue: &str,
    worker_id: &str,
    lease_seconds: f64,
) -> Result<Option<Job>> {
    let mut tx = pool.begin().await?;

    let row: Option<(Uuid, String, Value, i32, i32)> = sqlx::query_as(
        r#"
        WITH candidate AS (
          SELECT id
          FROM jobs
          WHERE queue = $1
            AND (
              (
                status = 'queued'::job_status
                AND run_at <= now()
              )
              OR
              (
                status = 'running'::job_status
                AND lock_expires_at IS NOT NULL
                AND lock_expires_at < now()
              )
            )
          ORDER BY run_at ASC
          LIMIT 1
          FOR UPDATE SKIP LOCKED
        )
        UPDATE jobs
        SET
          status = 'running'::job_status,
          locked_by = $2,
          locked_at = now(),
          lock_expires_at = now() + make_interval(secs => $3),
          attempt = attempt + 1,
          updated_at = now()
        WHERE id IN (SELECT id FROM candidate)
        RETURNING id, queue, payload_json, attempt, max_attempts
        "#,
    )
    .bind(queue)
    .bind(worker_id)
    .bind(lease_seconds)
    .fetch_optional(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(row.map(|(id, queue, payload_json, attempt, max_attempts)| Job {
        id,
        queue,
        payload_json,
        attempt,
        max_attempts,
    }))
}

pub async fn mark_done(pool: &PgPool, job_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'done'::job_status,
            locked_at = NULL,
            locked_by = NULL,
            lock_expires_at = NULL,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Rescheduled,
    Failed,
}

/// Handler errored: re-queue with backoff while attempts remain, otherwise
/// mark the job failed. The error message lands in last_error either way.
pub async fn retry_or_fail(pool: &PgPool, job: &Job, err: &anyhow::Error) -> Result<JobDisposition> {
    let message = format!("{err:#}");

    if job.attempt < job.max_attempts {
        let delay =
            compute_backoff_with_jitter(job.id, job.attempt, BASE_DELAY_SECS, CAP_DELAY_SECS);
        let next_time = Utc::now() + chrono::Duration::seconds(delay);

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued'::job_status,
                run_at = $2,
                last_error = $3,
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(next_time)
        .bind(&message)
        .execute(pool)
        .await?;

        return Ok(JobDisposition::Rescheduled);
    }

    sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed'::job_status,
            last_error = $2,
            locked_at = NULL,
            locked_by = NULL,
            lock_expires_at = NULL,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(&message)
    .execute(pool)
    .await?;

    Ok(JobDisposition::Failed)
}

fn compute_backoff_with_jitter(job_id: Uuid, attempt_no: i32, base_secs: i64, cap_secs: i64) -> i64 {
    let exp = (attempt_no - 1).clamp(0, 30) as u32;
    let mut delay = base_secs.saturating_mul(2_i64.saturating_pow(exp));
    if delay > cap_secs {
        delay = cap_secs;
    }

    let bytes = job_id.as_bytes();
    let seed = u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]);

    let max_jitter_ms = std::cmp::min(1000, (delay * 100) as i32).max(0) as u64;
    let jitter_ms = if max_jitter_ms == 0 {
        0
    } else {
        seed % max_jitter_ms
    };

    delay + ((jitter_ms as i64 + 999) / 1000)
}
