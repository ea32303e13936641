use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::counters::CounterStore;
use crate::crypto::SecretCipher;
use crate::jobs;
use crate::plans::PlanMap;
use crate::queue::{self, JobDisposition};
use crate::service_ctx::ServiceContext;

const LEASE_SECONDS: f64 = 30.0;

/// Everything a job handler needs, shared by every worker task.
#[derive(Clone)]
pub struct WorkerCtx {
    pub pool: PgPool,
    pub svc: ServiceContext,
    pub counters: CounterStore,
    pub http: reqwest::Client,
    pub plan_map: PlanMap,
    pub secret_cipher: Option<SecretCipher>,
    pub stripe_secret_key: Option<String>,
    pub stripe_api_base: String,
    pub meter_event_name: String,
}

impl WorkerCtx {
    pub fn new(pool: PgPool, counters: CounterStore, cfg: &Config) -> Result<Self> {
        let secret_cipher = cfg
            .secrets_key
            .as_deref()
            .map(SecretCipher::from_passphrase)
            .transpose()?;
        let plan_map = PlanMap::parse(&cfg.plan_price_map, &cfg.metered_price_ids);

        Ok(Self {
            svc: ServiceContext::new(pool.clone()),
            pool,
            counters,
            http: reqwest::Client::new(),
            plan_map,
            secret_cipher,
            stripe_secret_key: cfg.stripe_secret_key.clone(),
            stripe_api_base: cfg.stripe_api_base.clone(),
            meter_event_name: cfg.meter_event_name.clone(),
        })
    }
}

/// Spawn the fixed-size worker pools, one set of tasks per queue.
pub fn spawn_worker_pools(ctx: &WorkerCtx, cfg: &Config) {
    let pools: &[(&str, usize)] = &[
        (jobs::DELIVER_WEBHOOK, cfg.delivery_workers),
        (jobs::PROCESS_BILLING_EVENT, cfg.ingest_workers),
        (jobs::AGGREGATE_USAGE, cfg.metering_workers),
        (jobs::SNAPSHOT_ACTIVE_SEATS, cfg.metering_workers),
        (jobs::REPORT_USAGE, cfg.metering_workers),
    ];

    for &(queue_name, count) in pools {
        for _ in 0..count {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                run_queue_worker(ctx, queue_name).await;
            });
        }
        tracing::info!(queue = queue_name, workers = count, "worker pool started");
    }
}

/// One worker task: lease, dispatch, ack, forever.
pub async fn run_queue_worker(ctx: WorkerCtx, queue_name: &'static str) {
    let worker_id = format!("worker-{}", Uuid::new_v4());
    tracing::info!(%worker_id, queue = queue_name, "worker started");

    loop {
        let leased = match queue::lease_one(&ctx.pool, queue_name, &worker_id, LEASE_SECONDS).await
        {
            Ok(leased) => leased,
            Err(e) => {
                tracing::error!(queue = queue_name, error=%e, "failed to lease job");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(job) = leased else {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            continue;
        };

        tracing::info!(
            job_id=%job.id,
            queue=%job.queue,
            attempt=job.attempt,
            payload=%job.payload_json,
            "leased job"
        );

        let res = dispatch(&ctx, &job).await;

        let ack = match res {
            Ok(()) => {
                let done = queue::mark_done(&ctx.pool, job.id).await;
                if done.is_ok() {
                    tracing::info!(job_id=%job.id, "job done");
                }
                done.map(|_| ())
            }
            Err(e) => {
                tracing::error!(job_id=%job.id, error=%format!("{e:#}"), "job failed");
                queue::retry_or_fail(&ctx.pool, &job, &e).await.map(|d| {
                    if matches!(d, JobDisposition::Failed) {
                        tracing::warn!(job_id=%job.id, "job exhausted its attempts");
                    }
                })
            }
        };

        // the lease expires on its own; another worker will pick the job up
        if let Err(e) = ack {
            tracing::error!(job_id=%job.id, error=%e, "failed to settle job");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
}

async fn dispatch(ctx: &WorkerCtx, job: &queue::Job) -> Result<()> {
    match job.queue.as_str() {
        jobs::DELIVER_WEBHOOK => jobs::delivery::run(ctx, job).await,
        jobs::PROCESS_BILLING_EVENT => jobs::billing::run(ctx, job).await,
        jobs::AGGREGATE_USAGE => jobs::metering::run_aggregate(ctx, job).await,
        jobs::SNAPSHOT_ACTIVE_SEATS => jobs::metering::run_snapshot(ctx, job).await,
        jobs::REPORT_USAGE => jobs::metering::run_report(ctx, job).await,
        other => {
            tracing::warn!(job_id=%job.id, queue=%other, "unknown queue, marking done");
            Ok(())
        }
    }
}
