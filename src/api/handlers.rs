//! API route handlers.
//!
//! Query endpoints never mutate state; the only write paths are the
//! backfill/test incident POST and the status-update POST, both of which
//! append rows (the storage model has no in-place update).

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use serde_json::json;

use crate::bus::{subjects, ErrorEnvelope};
use crate::metrics;
use crate::store::IncidentRow;
use crate::types::{IncidentCreated, IncidentStatus, TimelineEntry};

use super::persist::{row_from_created, store_with_retry};
use super::problem::Problem;
use super::state::ApiState;

// ============================================================================
// Health & metrics
// ============================================================================

/// GET /health — liveness plus readiness.
pub async fn get_health(State(state): State<ApiState>) -> Response {
    let body = json!({
        "status": if state.is_ready() { "ok" } else { "degraded" },
        "ready": state.is_ready(),
        "uptime_seconds": state.uptime_secs(),
    });
    let status = if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// GET /metrics — Prometheus text format (version 0.0.4).
pub async fn get_metrics() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
        .into_response()
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub time_range: Option<String>,
}

/// Parse a `<n><unit>` time range (`15m`, `1h`, `24h`, `7d`, `1w`).
/// Accepted range is (0, 1 year].
fn parse_time_range(raw: &str) -> Result<ChronoDuration, String> {
    let raw = raw.trim();
    if raw.len() < 2 {
        return Err(format!("time_range '{raw}' must look like 1h, 24h, 7d or 1w"));
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let value: i64 = digits
        .parse()
        .map_err(|_| format!("time_range '{raw}' has a non-numeric magnitude"))?;
    if value <= 0 {
        return Err("time_range must be positive".to_string());
    }
    let duration = match unit {
        "m" => ChronoDuration::minutes(value),
        "h" => ChronoDuration::hours(value),
        "d" => ChronoDuration::days(value),
        "w" => ChronoDuration::weeks(value),
        other => return Err(format!("time_range unit '{other}' is not one of m, h, d, w")),
    };
    if duration > ChronoDuration::days(366) {
        return Err("time_range must not exceed one year".to_string());
    }
    Ok(duration)
}

/// GET /api/v3/stats?time_range=24h
///
/// Incident breakdowns plus pipeline processing metrics and SLO
/// compliance. Metrics the core does not compute are returned as `null`
/// with a `note` — never fabricated.
pub async fn get_stats(
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, Problem> {
    let raw_range = query.time_range.unwrap_or_else(|| "24h".to_string());
    let range = parse_time_range(&raw_range)
        .map_err(|e| Problem::bad_request(e).with_instance("/api/v3/stats"))?;
    let since = state.clock.now() - range;

    let rows = state
        .store
        .incidents_since(since)
        .await
        .map_err(|e| Problem::internal(format!("stats query failed: {e}")))?;

    let mut by_severity = serde_json::Map::new();
    let mut by_status = serde_json::Map::new();
    let mut by_type = serde_json::Map::new();
    for row in &rows {
        bump(&mut by_severity, row.severity.as_str());
        bump(&mut by_status, &row.status);
        bump(&mut by_type, &row.incident_type);
    }

    let policy = state.policy.load();
    let fast_p99 = stage_p99("enricher.latency_ms");
    let insight_p99 = stage_p99("insight.latency_ms");

    let slo_compliance = json!({
        "fast_path": {
            "slo_p99_ms": policy.slo.fast_path_p99_ms,
            "observed_p99_ms": fast_p99,
            "compliant": fast_p99.map(|p| p <= policy.slo.fast_path_p99_ms),
        },
        "insight_path": {
            "slo_p99_ms": policy.slo.insight_path_p99_ms,
            "observed_p99_ms": insight_p99,
            "compliant": insight_p99.map(|p| p <= policy.slo.insight_path_p99_ms),
        },
    });

    Ok(Json(json!({
        "time_range": raw_range,
        "total_incidents": rows.len(),
        "by_severity": by_severity,
        "by_status": by_status,
        "by_type": by_type,
        "processing_metrics": {
            "detector": stage_metrics("detector.latency_ms"),
            "enricher": stage_metrics("enricher.latency_ms"),
            "correlator": stage_metrics("correlator.latency_ms"),
            "insight": stage_metrics("insight.latency_ms"),
        },
        "slo_compliance": slo_compliance,
        "mean_time_to_ack": null,
        "note": "mean_time_to_ack is not computed by the core pipeline",
    })))
}

fn bump(map: &mut serde_json::Map<String, serde_json::Value>, key: &str) {
    let count = map.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    map.insert(key.to_string(), json!(count + 1));
}

fn stage_p99(histogram: &str) -> Option<u64> {
    metrics::histogram(histogram).and_then(|h| h.quantile_ms(0.99))
}

fn stage_metrics(histogram: &str) -> serde_json::Value {
    match metrics::histogram(histogram) {
        Some(h) => json!({
            "observations": h.count(),
            "p99_ms": h.quantile_ms(0.99),
        }),
        None => json!({
            "observations": null,
            "p99_ms": null,
            "note": "no observations for this stage yet",
        }),
    }
}

// ============================================================================
// Trace
// ============================================================================

/// GET /api/v3/trace/{tracking_id}
///
/// End-to-end trace reconstructed from the per-stage emission timestamps
/// each stage persisted.
pub async fn get_trace(
    State(state): State<ApiState>,
    Path(tracking_id): Path<String>,
) -> Result<Json<serde_json::Value>, Problem> {
    let events = state
        .store
        .trace(&tracking_id)
        .await
        .map_err(|e| Problem::internal(format!("trace query failed: {e}")))?;

    if events.is_empty() {
        return Err(
            Problem::not_found(format!("no trace recorded for tracking id '{tracking_id}'"))
                .with_instance(format!("/api/v3/trace/{tracking_id}")),
        );
    }

    let first_ts = events[0].ts;
    let last = &events[events.len() - 1];
    let total_latency_ms = last
        .ts
        .signed_duration_since(first_ts)
        .num_milliseconds()
        .max(0) as u64
        + last.latency_ms;

    let stages: Vec<serde_json::Value> = events
        .iter()
        .map(|e| {
            json!({
                "stage": e.stage,
                "ts": e.ts,
                "latency_ms": e.latency_ms,
                "status": e.status,
            })
        })
        .collect();

    Ok(Json(json!({
        "tracking_id": tracking_id,
        "total_latency_ms": total_latency_ms,
        "stages": stages,
    })))
}

// ============================================================================
// Incidents
// ============================================================================

/// POST /api/v3/incidents — backfill/test ingestion of a full incident.
pub async fn create_incident(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Response, Problem> {
    let incident: IncidentCreated = serde_json::from_slice(&body)
        .map_err(|e| Problem::bad_request(format!("malformed incident: {e}")))?;

    let row = row_from_created(&incident);
    persist_or_dead_letter(&state, row, &body).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"incident_id": incident.incident_id})),
    )
        .into_response())
}

/// GET /api/v3/incidents/{incident_id} — current view (latest row).
pub async fn get_incident(
    State(state): State<ApiState>,
    Path(incident_id): Path<String>,
) -> Result<Json<serde_json::Value>, Problem> {
    let row = state
        .store
        .incident_latest(&incident_id)
        .await
        .map_err(|e| Problem::internal(format!("incident query failed: {e}")))?
        .ok_or_else(|| {
            Problem::not_found(format!("incident '{incident_id}' not found"))
                .with_instance(format!("/api/v3/incidents/{incident_id}"))
        })?;

    Ok(Json(render_incident(&row)))
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub new_status: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// POST /api/v3/incidents/{incident_id}/status
///
/// Appends a new row with the updated status. Transitions are monotonic
/// (`open → ack → resolved|suppressed`); anything else is rejected with 409.
pub async fn update_status(
    State(state): State<ApiState>,
    Path(incident_id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, Problem> {
    let update: StatusUpdate = serde_json::from_slice(&body)
        .map_err(|e| Problem::bad_request(format!("malformed status update: {e}")))?;

    let new_status = IncidentStatus::parse(&update.new_status).ok_or_else(|| {
        Problem::bad_request(format!(
            "unknown status '{}': expected open, ack, resolved or suppressed",
            update.new_status
        ))
    })?;

    let row = state
        .store
        .incident_latest(&incident_id)
        .await
        .map_err(|e| Problem::internal(format!("incident query failed: {e}")))?
        .ok_or_else(|| Problem::not_found(format!("incident '{incident_id}' not found")))?;

    let current = IncidentStatus::parse(&row.status)
        .ok_or_else(|| Problem::internal(format!("stored status '{}' unparseable", row.status)))?;

    if !current.can_transition_to(new_status) {
        return Err(Problem::conflict(format!(
            "illegal status transition {current} → {new_status}"
        )));
    }

    let now = state.clock.now();
    let mut timeline: Vec<TimelineEntry> =
        serde_json::from_str(&row.timeline_json).unwrap_or_default();
    timeline.push(TimelineEntry {
        ts: now,
        event: "status_changed".to_string(),
        source: "incident_api".to_string(),
        description: update
            .explanation
            .unwrap_or_else(|| format!("status {current} → {new_status}")),
    });

    let updated = IncidentRow {
        status: new_status.as_str().to_string(),
        timeline_json: serde_json::to_string(&timeline).unwrap_or(row.timeline_json.clone()),
        updated_at: now,
        ..row
    };
    persist_or_dead_letter(&state, updated, &body).await?;

    Ok(Json(json!({
        "incident_id": incident_id,
        "status": new_status,
    })))
}

/// Write with retry; on persistent failure, dead-letter the request body
/// and surface a 5xx.
async fn persist_or_dead_letter(
    state: &ApiState,
    row: IncidentRow,
    original: &[u8],
) -> Result<(), Problem> {
    if let Err(e) = store_with_retry(state.store.as_ref(), row).await {
        metrics::inc("incident_api.dlq_published");
        let envelope = ErrorEnvelope {
            stage: "incident_api".to_string(),
            subject: "http".to_string(),
            error: e.to_string(),
            ts: state.clock.now(),
            payload: serde_json::from_slice(original).unwrap_or(serde_json::Value::Null),
        };
        if let Ok(bytes) = serde_json::to_vec(&envelope) {
            let _ = state.bus.publish(&subjects::dlq("incident_api"), bytes).await;
        }
        return Err(Problem::internal(format!("incident write failed: {e}")));
    }
    Ok(())
}

fn render_incident(row: &IncidentRow) -> serde_json::Value {
    let timeline: serde_json::Value =
        serde_json::from_str(&row.timeline_json).unwrap_or(serde_json::Value::Array(Vec::new()));
    let ai: Option<serde_json::Value> = row
        .ai_json
        .as_deref()
        .and_then(|json| serde_json::from_str(json).ok());

    json!({
        "incident_id": row.incident_id,
        "created_at": row.created_at,
        "updated_at": row.updated_at,
        "ship_id": row.ship_id,
        "domain": row.domain,
        "incident_type": row.incident_type,
        "severity": row.severity,
        "status": row.status,
        "member_anomaly_ids": row.member_anomaly_ids,
        "timeline": timeline,
        "tracking_id": row.tracking_id,
        "ai": ai,
    })
}
