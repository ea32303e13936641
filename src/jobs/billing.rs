use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::plans::PlanMap;
use crate::queue::{self, EnqueueOptions, Job};
use crate::stripe;
use crate::worker::WorkerCtx;

const PROVIDER_STRIPE: &str = "stripe";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEventJob {
    pub event_record_id: Uuid,
    pub provider: String,
    pub event_type: String,
    pub external_event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    Skipped { reason: &'static str },
}

/// Routing table for provider events. Anything not listed here is a no-op
/// success so new provider event types never wedge the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BillingEvent {
    CheckoutCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentFailed,
    CustomerUpdated,
}

impl BillingEvent {
    fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "checkout.session.completed" => Some(Self::CheckoutCompleted),
            "customer.subscription.created" => Some(Self::SubscriptionCreated),
            "customer.subscription.updated" => Some(Self::SubscriptionUpdated),
            "customer.subscription.deleted" => Some(Self::SubscriptionDeleted),
            "invoice.paid" => Some(Self::InvoicePaid),
            "invoice.payment_failed" => Some(Self::InvoicePaymentFailed),
            "customer.updated" => Some(Self::CustomerUpdated),
            _ => None,
        }
    }
}

pub async fn run(ctx: &WorkerCtx, job: &Job) -> Result<()> {
    let payload: BillingEventJob = serde_json::from_value(job.payload_json.clone())
        .context("malformed billing event job payload")?;

    let outcome = process(ctx, payload.event_record_id).await?;
    match outcome {
        ProcessOutcome::Processed => {
            tracing::info!(
                event_record_id=%payload.event_record_id,
                event_type=%payload.event_type,
                external_event_id=%payload.external_event_id,
                "billing event processed"
            );
        }
        ProcessOutcome::Skipped { reason } => {
            tracing::info!(
                event_record_id=%payload.event_record_id,
                external_event_id=%payload.external_event_id,
                reason,
                "billing event skipped"
            );
        }
    }
    Ok(())
}

/// Reconcile one stored provider event. Failures are written back to the
/// event row (error + retry_count) before the error propagates for the
/// substrate to retry.
pub async fn process(ctx: &WorkerCtx, event_record_id: Uuid) -> Result<ProcessOutcome> {
    match reconcile(ctx, event_record_id).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            record_failure(ctx, event_record_id, &e).await;
            Err(e)
        }
    }
}

async fn reconcile(ctx: &WorkerCtx, event_record_id: Uuid) -> Result<ProcessOutcome> {
    let mut stx = ctx.svc.begin("process_billing_event").await?;

    let row: Option<(String, String, Value, bool, Option<DateTime<Utc>>)> = sqlx::query_as(
        r#"
        SELECT provider, event_type, payload, verified, processed_at
        FROM incoming_webhook_events
        WHERE id = $1
        "#,
    )
    .bind(event_record_id)
    .fetch_optional(&mut *stx)
    .await?;

    let (provider, event_type, payload, verified, processed_at) =
        row.ok_or_else(|| anyhow!("incoming webhook event {event_record_id} not found"))?;

    if processed_at.is_some() {
        return Ok(ProcessOutcome::Skipped {
            reason: "already_processed",
        });
    }
    if !verified {
        return Ok(ProcessOutcome::Skipped {
            reason: "not_verified",
        });
    }

    if provider != PROVIDER_STRIPE {
        bail!("Unknown provider: {provider}");
    }

    if let Some(event) = BillingEvent::from_event_type(&event_type) {
        let object = stripe::event_object(&payload)?.clone();
        match event {
            BillingEvent::CheckoutCompleted => {
                handle_checkout_completed(&mut stx, &object).await?;
            }
            BillingEvent::SubscriptionCreated | BillingEvent::SubscriptionUpdated => {
                handle_subscription_upsert(&mut stx, &ctx.plan_map, &object).await?;
            }
            BillingEvent::SubscriptionDeleted => {
                handle_subscription_deleted(&mut stx, &object).await?;
            }
            BillingEvent::InvoicePaid => {
                handle_invoice_paid(&mut stx, &object).await?;
            }
            BillingEvent::InvoicePaymentFailed => {
                handle_invoice_payment_failed(&mut stx, &object).await?;
            }
            BillingEvent::CustomerUpdated => {
                handle_customer_updated(&mut stx, &object).await?;
            }
        }
    } else {
        tracing::info!(event_type, "ignoring unhandled billing event type");
    }

    // reconciliation writes and the idempotency marker commit together
    sqlx::query(
        r#"
        UPDATE incoming_webhook_events
        SET processed_at = now(), error = NULL
        WHERE id = $1
        "#,
    )
    .bind(event_record_id)
    .execute(&mut *stx)
    .await?;

    stx.commit().await?;
    Ok(ProcessOutcome::Processed)
}

/// Best effort: bookkeeping must never mask the original handler error.
async fn record_failure(ctx: &WorkerCtx, event_record_id: Uuid, err: &anyhow::Error) {
    let message = format!("{err:#}");

    let write = async {
        let mut stx = ctx.svc.begin("process_billing_event").await?;
        sqlx::query(
            r#"
            UPDATE incoming_webhook_events
            SET error = $2, retry_count = retry_count + 1
            WHERE id = $1
            "#,
        )
        .bind(event_record_id)
        .bind(&message)
        .execute(&mut *stx)
        .await?;
        stx.commit().await?;
        anyhow::Ok(())
    };

    if let Err(e) = write.await {
        tracing::error!(
            %event_record_id,
            error=%e,
            "failed to record billing event failure"
        );
    }
}

// -------------------- Event handlers --------------------

async fn handle_checkout_completed(conn: &mut PgConnection, object: &Value) -> Result<()> {
    let session: stripe::CheckoutSession = serde_json::from_value(object.clone())?;

    let Some(customer_id) = session.customer.as_deref() else {
        tracing::warn!("checkout session has no customer to link");
        return Ok(());
    };
    let org_id = session
        .org_id()
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| anyhow!("checkout session has no usable org reference"))?;
    let email = session
        .customer_details
        .as_ref()
        .and_then(|d| d.email.clone());

    sqlx::query(
        r#"
        INSERT INTO billing_customers (id, org_id, external_customer_id, email)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (org_id) DO UPDATE
        SET external_customer_id = EXCLUDED.external_customer_id,
            email = COALESCE(EXCLUDED.email, billing_customers.email),
            updated_at = now()
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(org_id)
    .bind(customer_id)
    .bind(email)
    .execute(&mut *conn)
    .await?;

    // a richer row arrives with customer.subscription.created; only make
    // sure the subscription exists so the org shows as subscribed
    if let Some(subscription_id) = session.subscription.as_deref() {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, org_id, external_subscription_id, status)
            VALUES ($1, $2, $3, 'active')
            ON CONFLICT (external_subscription_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(subscription_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn handle_subscription_upsert(
    conn: &mut PgConnection,
    plan_map: &PlanMap,
    object: &Value,
) -> Result<()> {
    let sub: stripe::SubscriptionObject = serde_json::from_value(object.clone())?;

    // checkout.session.completed may still be in flight; erroring here lets
    // the substrate retry after the customer row lands
    let org_id = org_for_customer(conn, &sub.customer)
        .await?
        .ok_or_else(|| anyhow!("no billing customer for {}", sub.customer))?;

    let price_id = sub.price_id().map(|p| p.to_string());
    let plan = plan_map.plan_for_price(price_id.as_deref()).to_string();
    let period_start = sub.current_period_start.and_then(stripe::datetime_from_epoch);
    let period_end = sub.current_period_end.and_then(stripe::datetime_from_epoch);
    let canceled_at = sub.canceled_at.and_then(stripe::datetime_from_epoch);

    sqlx::query(
        r#"
        INSERT INTO subscriptions
          (id, org_id, external_subscription_id, external_price_id, plan, status,
           current_period_start, current_period_end, cancel_at_period_end, canceled_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (external_subscription_id) DO UPDATE
        SET external_price_id = EXCLUDED.external_price_id,
            plan = EXCLUDED.plan,
            status = EXCLUDED.status,
            current_period_start = EXCLUDED.current_period_start,
            current_period_end = EXCLUDED.current_period_end,
            cancel_at_period_end = EXCLUDED.cancel_at_period_end,
            canceled_at = EXCLUDED.canceled_at,
            updated_at = now()
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(org_id)
    .bind(&sub.id)
    .bind(price_id)
    .bind(plan)
    .bind(&sub.status)
    .bind(period_start)
    .bind(period_end)
    .bind(sub.cancel_at_period_end)
    .bind(canceled_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn handle_subscription_deleted(conn: &mut PgConnection, object: &Value) -> Result<()> {
    let sub: stripe::SubscriptionObject = serde_json::from_value(object.clone())?;

    // the customer row may still be in flight; erroring keeps the
    // cancellation pending for the substrate to retry
    let org_id = org_for_customer(conn, &sub.customer)
        .await?
        .ok_or_else(|| anyhow!("no billing customer for {}", sub.customer))?;

    let canceled_at = sub
        .canceled_at
        .and_then(stripe::datetime_from_epoch)
        .unwrap_or_else(Utc::now);

    sqlx::query(
        r#"
        INSERT INTO subscriptions
          (id, org_id, external_subscription_id, status, canceled_at)
        VALUES ($1, $2, $3, 'canceled', $4)
        ON CONFLICT (external_subscription_id) DO UPDATE
        SET status = 'canceled',
            canceled_at = EXCLUDED.canceled_at,
            updated_at = now()
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(org_id)
    .bind(&sub.id)
    .bind(canceled_at)
    .execute(&mut *conn)
    .await?;

    notify_org_owners(conn, org_id, "subscription_canceled").await?;
    Ok(())
}

async fn handle_invoice_paid(conn: &mut PgConnection, object: &Value) -> Result<()> {
    let invoice: stripe::InvoiceObject = serde_json::from_value(object.clone())?;

    // one-off invoices have no subscription to reconcile
    let Some(subscription_id) = invoice.subscription.as_deref() else {
        return Ok(());
    };

    sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = 'active', updated_at = now()
        WHERE external_subscription_id = $1
        "#,
    )
    .bind(subscription_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn handle_invoice_payment_failed(conn: &mut PgConnection, object: &Value) -> Result<()> {
    let invoice: stripe::InvoiceObject = serde_json::from_value(object.clone())?;

    if let Some(subscription_id) = invoice.subscription.as_deref() {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', updated_at = now()
            WHERE external_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .execute(&mut *conn)
        .await?;
    }

    let Some(customer_id) = invoice.customer.as_deref() else {
        return Ok(());
    };
    let Some(org_id) = org_for_customer(conn, customer_id).await? else {
        tracing::warn!(customer=%customer_id, "payment failure for unknown customer");
        return Ok(());
    };

    notify_org_owners(conn, org_id, "payment_failed").await?;
    Ok(())
}

async fn handle_customer_updated(conn: &mut PgConnection, object: &Value) -> Result<()> {
    let customer: stripe::CustomerObject = serde_json::from_value(object.clone())?;

    let updated = sqlx::query(
        r#"
        UPDATE billing_customers
        SET email = $2, updated_at = now()
        WHERE external_customer_id = $1
        "#,
    )
    .bind(&customer.id)
    .bind(&customer.email)
    .execute(&mut *conn)
    .await?;

    // nothing to reconcile and nothing a retry would find
    if updated.rows_affected() == 0 {
        tracing::warn!(customer=%customer.id, "customer update for unknown billing customer");
    }

    Ok(())
}

// -------------------- Shared helpers --------------------

async fn org_for_customer(
    conn: &mut PgConnection,
    external_customer_id: &str,
) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> =
        sqlx::query_as("SELECT org_id FROM billing_customers WHERE external_customer_id = $1")
            .bind(external_customer_id)
            .fetch_optional(conn)
            .await?;
    Ok(row.map(|(org_id,)| org_id))
}

/// One notification job per owner, enqueued inside the reconciliation
/// transaction so fan-out and state change commit or roll back together.
async fn notify_org_owners(
    conn: &mut PgConnection,
    org_id: Uuid,
    notification_type: &str,
) -> Result<usize> {
    let owners: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT user_id FROM organization_members WHERE org_id = $1 AND role = 'owner'",
    )
    .bind(org_id)
    .fetch_all(&mut *conn)
    .await?;

    for (user_id,) in &owners {
        queue::enqueue(
            &mut *conn,
            crate::jobs::SEND_NOTIFICATION,
            json!({
                "type": notification_type,
                "org_id": org_id,
                "user_id": user_id,
            }),
            EnqueueOptions::default(),
        )
        .await?;
    }

    tracing::info!(%org_id, notification_type, owners=owners.len(), "queued owner notifications");
    Ok(owners.len())
}
