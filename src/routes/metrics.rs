use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use crate::state::AppState;

pub async fn get_metrics(State(state): State<AppState>) -> Response {
    let jobs = match sqlx::query_as::<_, (i64, i64, i64, i64)>(
        r#"
        SELECT
          COUNT(*) FILTER (WHERE status = 'queued')::bigint AS queued,
          COUNT(*) FILTER (WHERE status = 'running')::bigint AS running,
          COUNT(*) FILTER (WHERE status = 'done')::bigint AS done,
          COUNT(*) FILTER (WHERE status = 'failed')::bigint AS failed
        FROM jobs
        "#,
    )
    .fetch_one(&state.pool)
    .await
    {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error=%e, "failed to collect metrics: jobs");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to collect metrics".to_string(),
            )
                .into_response();
        }
    };

    let deliveries = match sqlx::query_as::<_, (i64, i64, i64)>(
        r#"
        SELECT
          COUNT(*)::bigint AS total,
          COUNT(*) FILTER (WHERE delivered_at IS NOT NULL)::bigint AS delivered,
          COUNT(*) FILTER (WHERE failed_at IS NOT NULL)::bigint AS failed
        FROM webhook_deliveries
        "#,
    )
    .fetch_one(&state.pool)
    .await
    {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error=%e, "failed to collect metrics: webhook_deliveries");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to collect metrics".to_string(),
            )
                .into_response();
        }
    };

    let incoming = match sqlx::query_as::<_, (i64, i64)>(
        r#"
        SELECT
          COUNT(*)::bigint AS total,
          COUNT(*) FILTER (WHERE processed_at IS NOT NULL)::bigint AS processed
        FROM incoming_webhook_events
        "#,
    )
    .fetch_one(&state.pool)
    .await
    {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error=%e, "failed to collect metrics: incoming_webhook_events");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to collect metrics".to_string(),
            )
                .into_response();
        }
    };

    let unreported_usage = match sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*)::bigint FROM usage_records WHERE reported_to_stripe = FALSE",
    )
    .fetch_one(&state.pool)
    .await
    {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error=%e, "failed to collect metrics: usage_records");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to collect metrics".to_string(),
            )
                .into_response();
        }
    };

    let pending_deliveries = deliveries.0 - deliveries.1 - deliveries.2;

    let body = format!(
        concat!(
            "# HELP conveyor_build_info Build information.\n",
            "# TYPE conveyor_build_info gauge\n",
            "conveyor_build_info{{version=\"{}\"}} 1\n",
            "# HELP conveyor_jobs_status Jobs by status.\n",
            "# TYPE conveyor_jobs_status gauge\n",
            "conveyor_jobs_status{{status=\"queued\"}} {}\n",
            "conveyor_jobs_status{{status=\"running\"}} {}\n",
            "conveyor_jobs_status{{status=\"done\"}} {}\n",
            "conveyor_jobs_status{{status=\"failed\"}} {}\n",
            "# HELP conveyor_deliveries_total Total webhook deliveries.\n",
            "# TYPE conveyor_deliveries_total gauge\n",
            "conveyor_deliveries_total {}\n",
            "# HELP conveyor_deliveries_status Webhook deliveries by outcome.\n",
            "# TYPE conveyor_deliveries_status gauge\n",
            "conveyor_deliveries_status{{status=\"delivered\"}} {}\n",
            "conveyor_deliveries_status{{status=\"failed\"}} {}\n",
            "conveyor_deliveries_status{{status=\"pending\"}} {}\n",
            "# HELP conveyor_incoming_events_total Provider events recorded.\n",
            "# TYPE conveyor_incoming_events_total gauge\n",
            "conveyor_incoming_events_total {}\n",
            "# HELP conveyor_incoming_events_processed Provider events reconciled.\n",
            "# TYPE conveyor_incoming_events_processed gauge\n",
            "conveyor_incoming_events_processed {}\n",
            "# HELP conveyor_usage_records_unreported Usage records not yet reported.\n",
            "# TYPE conveyor_usage_records_unreported gauge\n",
            "conveyor_usage_records_unreported {}\n"
        ),
        env!("CARGO_PKG_VERSION"),
        jobs.0,
        jobs.1,
        jobs.2,
        jobs.3,
        deliveries.0,
        deliveries.1,
        deliveries.2,
        pending_deliveries,
        incoming.0,
        incoming.1,
        unreported_usage
    );

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        )],
        body,
    )
        .into_response()
}
