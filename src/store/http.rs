//! HTTP client for the columnar storage engine.
//!
//! Speaks the engine's HTTP query interface: a `'static` SQL template with
//! `{name:Type}` placeholders plus a `param_<name>` value per binding, rows
//! returned as JSON-per-line. Templates being `'static` is the interpolation
//! guard — there is no constructor that accepts a runtime-assembled string.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use super::{
    AnomalyRow, ColumnStore, IncidentRow, LlmCacheRow, StageEvent, StoreError,
};
use crate::types::{DeviceMetadata, Domain, FailureRates, RecentIncident, SimilarAnomaly};

/// Read-query timeout. The enricher applies its own tighter budget on top.
const READ_TIMEOUT: Duration = Duration::from_millis(1_500);
/// Write timeout; inserts are buffered by the engine and usually fast.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameterized query: a fixed template and its bindings.
struct ParamQuery {
    sql: &'static str,
    params: Vec<(&'static str, String)>,
}

impl ParamQuery {
    fn new(sql: &'static str) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }

    fn bind(mut self, name: &'static str, value: impl ToString) -> Self {
        self.params.push((name, value.to_string()));
        self
    }
}

pub struct HttpColumnStore {
    http: reqwest::Client,
    base_url: String,
    user: Option<String>,
    pass: Option<String>,
}

impl HttpColumnStore {
    pub fn new(base_url: &str, user: Option<String>, pass: Option<String>) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
            pass,
        })
    }

    async fn execute(&self, query: ParamQuery, timeout: Duration) -> Result<String, StoreError> {
        let mut request = self
            .http
            .post(&self.base_url)
            .timeout(timeout)
            .query(&[("query", query.sql)]);
        for (name, value) in &query.params {
            request = request.query(&[(format!("param_{name}"), value.as_str())]);
        }
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.pass.as_deref());
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(StoreError::Schema(format!("auth rejected: {status}")));
            }
            return Err(StoreError::Query(format!("{status}: {body}")));
        }
        Ok(body)
    }

    async fn fetch_rows<T: DeserializeOwned>(
        &self,
        query: ParamQuery,
    ) -> Result<Vec<T>, StoreError> {
        let body = self.execute(query, READ_TIMEOUT).await?;
        body.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str::<T>(l).map_err(StoreError::from))
            .collect()
    }

    async fn insert_row<T: Serialize>(
        &self,
        insert_sql: &'static str,
        row: &T,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_string(row)?;
        let mut request = self
            .http
            .post(&self.base_url)
            .timeout(WRITE_TIMEOUT)
            .query(&[("query", insert_sql)])
            .body(body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.pass.as_deref());
        }
        let response = request.send().await.map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Query(format!("{status}: {body}")));
        }
        Ok(())
    }
}

fn map_reqwest_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else if e.is_connect() {
        StoreError::Unreachable(e.to_string())
    } else {
        StoreError::Query(e.to_string())
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(serde::Deserialize)]
struct SeverityBucket {
    severity: Option<String>,
    c: u64,
    s: f64,
}

#[async_trait]
impl ColumnStore for HttpColumnStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.execute(ParamQuery::new("SELECT 1"), Duration::from_secs(2))
            .await
            .map(|_| ())
    }

    async fn insert_anomaly(&self, row: AnomalyRow) -> Result<(), StoreError> {
        self.insert_row("INSERT INTO anomalies FORMAT JSONEachRow", &row)
            .await
    }

    async fn device_metadata(
        &self,
        ship_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceMetadata>, StoreError> {
        let rows: Vec<DeviceMetadata> = self
            .fetch_rows(
                ParamQuery::new(
                    "SELECT ship_id, device_id, device_type, vendor, model, criticality \
                     FROM devices \
                     WHERE ship_id = {ship_id:String} AND device_id = {device_id:String} \
                     LIMIT 1 FORMAT JSONEachRow",
                )
                .bind("ship_id", ship_id)
                .bind("device_id", device_id),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn failure_rates(
        &self,
        ship_id: &str,
        domain: Domain,
        since: DateTime<Utc>,
    ) -> Result<FailureRates, StoreError> {
        let buckets: Vec<SeverityBucket> = self
            .fetch_rows(
                ParamQuery::new(
                    "SELECT severity, count() AS c, avg(score) AS s \
                     FROM anomalies \
                     WHERE ship_id = {ship_id:String} AND domain = {domain:String} \
                       AND ts >= {since:DateTime64(3)} \
                     GROUP BY severity FORMAT JSONEachRow",
                )
                .bind("ship_id", ship_id)
                .bind("domain", domain.as_str())
                .bind("since", ts(since)),
            )
            .await?;

        let mut rates = FailureRates::default();
        let mut score_sum = 0.0;
        for bucket in buckets {
            rates.count += bucket.c;
            score_sum += bucket.s * bucket.c as f64;
            if let Some(severity) = bucket.severity {
                *rates.count_by_severity.entry(severity).or_default() += bucket.c;
            }
        }
        if rates.count > 0 {
            rates.avg_score = score_sum / rates.count as f64;
        }
        Ok(rates)
    }

    async fn similar_anomalies(
        &self,
        ship_id: &str,
        domain: Domain,
        anomaly_type: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SimilarAnomaly>, StoreError> {
        self.fetch_rows(
            ParamQuery::new(
                "SELECT ts, anomaly_type, score, severity, tracking_id \
                 FROM anomalies \
                 WHERE ship_id = {ship_id:String} AND domain = {domain:String} \
                   AND anomaly_type = {anomaly_type:String} AND ts >= {since:DateTime64(3)} \
                 ORDER BY ts DESC LIMIT {limit:UInt32} FORMAT JSONEachRow",
            )
            .bind("ship_id", ship_id)
            .bind("domain", domain.as_str())
            .bind("anomaly_type", anomaly_type)
            .bind("since", ts(since))
            .bind("limit", limit),
        )
        .await
    }

    async fn recent_incidents(
        &self,
        ship_id: &str,
        domain: Domain,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecentIncident>, StoreError> {
        self.fetch_rows(
            ParamQuery::new(
                "SELECT incident_id, created_at, incident_type, severity, status \
                 FROM incidents \
                 WHERE ship_id = {ship_id:String} AND domain = {domain:String} \
                   AND created_at >= {since:DateTime64(3)} \
                 ORDER BY updated_at DESC LIMIT 1 BY incident_id \
                 ORDER BY created_at DESC LIMIT {limit:UInt32} FORMAT JSONEachRow",
            )
            .bind("ship_id", ship_id)
            .bind("domain", domain.as_str())
            .bind("since", ts(since))
            .bind("limit", limit),
        )
        .await
    }

    async fn insert_incident(&self, row: IncidentRow) -> Result<(), StoreError> {
        self.insert_row("INSERT INTO incidents FORMAT JSONEachRow", &row)
            .await
    }

    async fn incident_latest(&self, incident_id: &str) -> Result<Option<IncidentRow>, StoreError> {
        let rows: Vec<IncidentRow> = self
            .fetch_rows(
                ParamQuery::new(
                    "SELECT * FROM incidents \
                     WHERE incident_id = {incident_id:String} \
                     ORDER BY updated_at DESC LIMIT 1 FORMAT JSONEachRow",
                )
                .bind("incident_id", incident_id),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn incidents_since(&self, since: DateTime<Utc>) -> Result<Vec<IncidentRow>, StoreError> {
        self.fetch_rows(
            ParamQuery::new(
                "SELECT * FROM incidents \
                 WHERE created_at >= {since:DateTime64(3)} \
                 ORDER BY updated_at DESC LIMIT 1 BY incident_id FORMAT JSONEachRow",
            )
            .bind("since", ts(since)),
        )
        .await
    }

    async fn cache_get(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LlmCacheRow>, StoreError> {
        let rows: Vec<LlmCacheRow> = self
            .fetch_rows(
                ParamQuery::new(
                    "SELECT cache_key, response_json, created_at, ttl_sec \
                     FROM llm_cache \
                     WHERE cache_key = {cache_key:String} \
                     ORDER BY created_at DESC LIMIT 1 FORMAT JSONEachRow",
                )
                .bind("cache_key", cache_key),
            )
            .await?;
        Ok(rows.into_iter().next().filter(|row| row.is_fresh(now)))
    }

    async fn cache_put(&self, row: LlmCacheRow) -> Result<(), StoreError> {
        self.insert_row("INSERT INTO llm_cache FORMAT JSONEachRow", &row)
            .await
    }

    async fn record_stage(&self, event: StageEvent) -> Result<(), StoreError> {
        self.insert_row("INSERT INTO stage_trace FORMAT JSONEachRow", &event)
            .await
    }

    async fn trace(&self, tracking_id: &str) -> Result<Vec<StageEvent>, StoreError> {
        self.fetch_rows(
            ParamQuery::new(
                "SELECT tracking_id, stage, ts, latency_ms, status \
                 FROM stage_trace \
                 WHERE tracking_id = {tracking_id:String} \
                 ORDER BY ts ASC FORMAT JSONEachRow",
            )
            .bind("tracking_id", tracking_id),
        )
        .await
    }
}
