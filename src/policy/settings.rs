//! Per-component runtime settings sourced from the environment.
//!
//! Endpoints and credentials live here; behavioral knobs live in the policy
//! file. Every value has a sensible default so a bare `tidewatch` starts on
//! a laptop with the in-memory bus and store.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind address of the incident API.
    pub server_addr: String,
    /// Pub/sub bus endpoint. `memory://local` selects the in-process bus.
    pub bus_url: String,
    /// Columnar store endpoint. `memory://local` selects the in-memory store.
    pub store_url: String,
    pub store_user: Option<String>,
    pub store_pass: Option<String>,
    /// LLM runtime endpoint (`{model, prompt, stream}` → `{response}`).
    pub llm_url: String,
    /// Vector store endpoint (upsert/search).
    pub vector_url: String,
    /// Explicit policy file path, if set.
    pub policy_path: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            server_addr: env_or("TIDEWATCH_SERVER_ADDR", "0.0.0.0:8080"),
            bus_url: env_or("TIDEWATCH_BUS_URL", "memory://local"),
            store_url: env_or("TIDEWATCH_STORE_URL", "memory://local"),
            store_user: std::env::var("TIDEWATCH_STORE_USER").ok().filter(|s| !s.is_empty()),
            store_pass: std::env::var("TIDEWATCH_STORE_PASS").ok().filter(|s| !s.is_empty()),
            llm_url: env_or("TIDEWATCH_LLM_URL", "http://127.0.0.1:11434/api/generate"),
            vector_url: env_or("TIDEWATCH_VECTOR_URL", "http://127.0.0.1:6333"),
            policy_path: std::env::var("TIDEWATCH_POLICY").ok().map(PathBuf::from),
        }
    }

    /// True when the in-memory store was selected (single-node/dev mode).
    pub fn store_is_memory(&self) -> bool {
        self.store_url.starts_with("memory://")
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}
