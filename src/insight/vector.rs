//! Vector store client: black-box similarity over past incidents.
//!
//! The store exposes `upsert(id, embedding, metadata)` and
//! `search(embedding, k, filter)`. Embeddings are opaque to the pipeline —
//! the feature-hash embedding below is just a deterministic key that puts
//! incidents with the same identity fields near each other; a deployment
//! with a real embedding service swaps it without touching the enricher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::Duration;

pub const EMBEDDING_DIM: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("vector store request failed: {0}")]
    Http(String),
    #[error("vector store returned status {0}")]
    Status(u16),
    #[error("vector store request timed out")]
    Timeout,
    #[error("vector store response malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    async fn upsert(
        &self,
        id: &str,
        embedding: Vec<f32>,
        metadata: serde_json::Value,
        timeout: Duration,
    ) -> Result<(), VectorError>;

    async fn search(
        &self,
        embedding: Vec<f32>,
        k: usize,
        filter: serde_json::Value,
        timeout: Duration,
    ) -> Result<Vec<SearchHit>, VectorError>;
}

/// Deterministic feature-hash embedding over incident identity fields.
pub fn feature_embedding(incident_type: &str, service: &str, severity: &str) -> Vec<f32> {
    let mut embedding = vec![0.0f32; EMBEDDING_DIM];
    for (weight, token) in [(2.0, incident_type), (1.0, service), (0.5, severity)] {
        for gram in token.as_bytes().windows(3) {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            gram.hash(&mut hasher);
            let slot = (hasher.finish() as usize) % EMBEDDING_DIM;
            embedding[slot] += weight;
        }
    }
    let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut embedding {
            *value /= norm;
        }
    }
    embedding
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    id: &'a str,
    embedding: &'a [f32],
    metadata: &'a serde_json::Value,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    embedding: &'a [f32],
    k: usize,
    filter: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

pub struct HttpSimilarityIndex {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSimilarityIndex {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn map_error(e: reqwest::Error) -> VectorError {
        if e.is_timeout() {
            VectorError::Timeout
        } else {
            VectorError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl SimilarityIndex for HttpSimilarityIndex {
    async fn upsert(
        &self,
        id: &str,
        embedding: Vec<f32>,
        metadata: serde_json::Value,
        timeout: Duration,
    ) -> Result<(), VectorError> {
        let response = self
            .http
            .post(format!("{}/upsert", self.base_url))
            .timeout(timeout)
            .json(&UpsertRequest {
                id,
                embedding: &embedding,
                metadata: &metadata,
            })
            .send()
            .await
            .map_err(Self::map_error)?;
        if !response.status().is_success() {
            return Err(VectorError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn search(
        &self,
        embedding: Vec<f32>,
        k: usize,
        filter: serde_json::Value,
        timeout: Duration,
    ) -> Result<Vec<SearchHit>, VectorError> {
        let response = self
            .http
            .post(format!("{}/search", self.base_url))
            .timeout(timeout)
            .json(&SearchRequest {
                embedding: &embedding,
                k,
                filter: &filter,
            })
            .send()
            .await
            .map_err(Self::map_error)?;
        if !response.status().is_success() {
            return Err(VectorError::Status(response.status().as_u16()));
        }
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| VectorError::Malformed(e.to_string()))?;
        Ok(body.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_embedding_deterministic_and_normalized() {
        let a = feature_embedding("cpu_pressure", "cpu-monitor", "high");
        let b = feature_embedding("cpu_pressure", "cpu-monitor", "high");
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_feature_embedding_distinguishes_types() {
        let a = feature_embedding("cpu_pressure", "cpu-monitor", "high");
        let b = feature_embedding("link_flap", "vsat", "high");
        assert_ne!(a, b);
    }
}
