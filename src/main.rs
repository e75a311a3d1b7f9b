//! Tidewatch - Maritime Fleet AIOps Event Pipeline
//!
//! Runs the full Detect → Enrich → Correlate → Persist pipeline plus the
//! asynchronous Insight Path in one supervised process (the deployment unit
//! is a ship / edge site).
//!
//! # Usage
//!
//! ```bash
//! # Single-node mode: in-process bus, in-memory store
//! cargo run --release
//!
//! # Against a real columnar store and LLM runtime
//! TIDEWATCH_STORE_URL=http://storage:8123 \
//! TIDEWATCH_LLM_URL=http://llm:11434/api/generate \
//! cargo run --release -- --policy /etc/tidewatch/policy.toml
//! ```
//!
//! # Environment Variables
//!
//! - `TIDEWATCH_SERVER_ADDR`: HTTP bind address (default: 0.0.0.0:8080)
//! - `TIDEWATCH_STORE_URL`: columnar store endpoint (`memory://local` default)
//! - `TIDEWATCH_STORE_USER` / `TIDEWATCH_STORE_PASS`: store credentials
//! - `TIDEWATCH_LLM_URL` / `TIDEWATCH_LLM_MODEL`: LLM runtime
//! - `TIDEWATCH_VECTOR_URL`: vector store endpoint
//! - `TIDEWATCH_POLICY`: path to the policy TOML
//! - `RUST_LOG`: logging level (default: info)
//!
//! # Exit Codes
//!
//! - 0: normal shutdown
//! - 1: configuration error
//! - 2: dependency unreachable at startup for more than 60 s

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tidewatch::api::{create_app, ApiState, IncidentPersister};
use tidewatch::correlator::Correlator;
use tidewatch::detector::DetectorService;
use tidewatch::enricher::FastEnricher;
use tidewatch::insight::{HttpLanguageModel, HttpSimilarityIndex, InsightEnricher};
use tidewatch::policy::{watcher, Policy, Settings};
use tidewatch::{
    HttpColumnStore, MemoryBus, MemoryColumnStore, SharedBus, SharedClock, SharedStore,
    SystemClock,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "tidewatch")]
#[command(about = "Tidewatch Maritime Fleet AIOps Event Pipeline")]
#[command(version)]
struct CliArgs {
    /// Override the HTTP server bind address (default: "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Path to the policy TOML file (overrides TIDEWATCH_POLICY)
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Seconds to wait for dependencies at startup before giving up
    #[arg(long, default_value = "60")]
    probe_timeout_secs: u64,
}

// ============================================================================
// Task identification for supervisor logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    Detector,
    FastEnricher,
    Correlator,
    InsightEnricher,
    IncidentPersister,
    PolicyWatcher,
    HealthMonitor,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::Detector => write!(f, "Detector"),
            TaskName::FastEnricher => write!(f, "FastEnricher"),
            TaskName::Correlator => write!(f, "Correlator"),
            TaskName::InsightEnricher => write!(f, "InsightEnricher"),
            TaskName::IncidentPersister => write!(f, "IncidentPersister"),
            TaskName::PolicyWatcher => write!(f, "PolicyWatcher"),
            TaskName::HealthMonitor => write!(f, "HealthMonitor"),
        }
    }
}

// ============================================================================
// Startup dependency probe
// ============================================================================

/// Ping the columnar store until it answers or the probe window closes.
/// The LLM and vector store are not probed: the insight path has a full
/// fallback and must not hold the fast path hostage at startup.
async fn probe_dependencies(store: &SharedStore, window: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + window;
    let mut attempt = 0u32;
    loop {
        match store.ping().await {
            Ok(()) => {
                info!("Columnar store reachable");
                return true;
            }
            Err(e) => {
                attempt += 1;
                if tokio::time::Instant::now() >= deadline {
                    error!(error = %e, attempts = attempt, "Columnar store unreachable, giving up");
                    return false;
                }
                warn!(error = %e, attempt = attempt, "Columnar store not ready, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

// ============================================================================
// Pipeline runner
// ============================================================================

async fn run_pipeline(
    settings: Settings,
    policy: Policy,
    server_addr: String,
    policy_path: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<()> {
    let shared_policy = policy.into_shared();
    let clock: SharedClock = Arc::new(SystemClock);
    let bus: SharedBus = MemoryBus::new();

    let store: SharedStore = if settings.store_is_memory() {
        info!("Store: in-memory (single-node mode)");
        MemoryColumnStore::new()
    } else {
        info!(url = %settings.store_url, "Store: columnar engine over HTTP");
        Arc::new(
            HttpColumnStore::new(
                &settings.store_url,
                settings.store_user.clone(),
                settings.store_pass.clone(),
            )
            .map_err(|e| anyhow::anyhow!("store client init failed: {e}"))?,
        )
    };

    let llm = Arc::new(HttpLanguageModel::new(&settings.llm_url));
    let vector = Arc::new(HttpSimilarityIndex::new(&settings.vector_url));

    let detector = DetectorService::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&shared_policy),
        Arc::clone(&clock),
    );
    let enricher = FastEnricher::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&shared_policy),
        Arc::clone(&clock),
    );
    let correlator = Correlator::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&shared_policy),
        Arc::clone(&clock),
    )
    .map_err(|e| anyhow::anyhow!("correlator init failed: {e}"))?;
    let insight = InsightEnricher::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&shared_policy),
        Arc::clone(&clock),
        llm,
        vector,
    );
    let persister = IncidentPersister::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&clock),
    );

    let api_state = ApiState::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&shared_policy),
        Arc::clone(&clock),
    );
    let app = create_app(api_state.clone());

    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {server_addr}: {e}"))?;
    info!(addr = %server_addr, "HTTP server listening");

    info!("Supervisor: spawning pipeline tasks");
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    let http_cancel = cancel.clone();
    task_set.spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                http_cancel.cancelled().await;
            })
            .await;
        match result {
            Ok(()) => Ok(TaskName::HttpServer),
            Err(e) => Err(anyhow::anyhow!("HTTP server error: {e}")),
        }
    });

    {
        let cancel = cancel.clone();
        task_set.spawn(async move {
            detector.run(cancel).await;
            Ok(TaskName::Detector)
        });
    }
    {
        let cancel = cancel.clone();
        task_set.spawn(async move {
            enricher.run(cancel).await;
            Ok(TaskName::FastEnricher)
        });
    }
    {
        let cancel = cancel.clone();
        task_set.spawn(async move {
            correlator.run(cancel).await;
            Ok(TaskName::Correlator)
        });
    }
    {
        let cancel = cancel.clone();
        task_set.spawn(async move {
            insight.run(cancel).await;
            Ok(TaskName::InsightEnricher)
        });
    }
    {
        let cancel = cancel.clone();
        task_set.spawn(async move {
            persister.run(cancel).await;
            Ok(TaskName::IncidentPersister)
        });
    }
    if let Some(path) = policy_path {
        let cancel = cancel.clone();
        let shared = Arc::clone(&shared_policy);
        task_set.spawn(async move {
            watcher::run_policy_watcher(path, shared, cancel).await;
            Ok(TaskName::PolicyWatcher)
        });
    }
    {
        // Permanent dependency failures (schema/auth) mark the process
        // unready; transient ones recover on the next successful ping.
        let cancel = cancel.clone();
        let store = Arc::clone(&store);
        let api_state = api_state.clone();
        task_set.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(TaskName::HealthMonitor),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
                match store.ping().await {
                    Ok(()) => {
                        if !api_state.is_ready() {
                            info!("Columnar store recovered, marking ready");
                            api_state.set_ready(true);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Columnar store health check failed, marking unready");
                        api_state.set_ready(false);
                    }
                }
            }
        });
    }

    info!("Supervisor: all tasks spawned, monitoring");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!(task = %task_name, "Supervisor: task completed normally");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Supervisor: task failed");
                        cancel.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Supervisor: task panicked");
                        cancel.cancel();
                        return Err(anyhow::anyhow!("task panicked: {e}"));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Give cancelled tasks a moment to drain, then drop the set.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while task_set.join_next().await.is_some() {}
    })
    .await;

    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let settings = Settings::from_env();
    let server_addr = args.addr.clone().unwrap_or_else(|| settings.server_addr.clone());

    info!("Tidewatch - Maritime Fleet AIOps Event Pipeline");

    // Configuration errors are exit code 1.
    let policy_path = args.policy.clone().or_else(|| settings.policy_path.clone());
    let policy = match Policy::load(policy_path.as_deref()) {
        Ok(policy) => policy,
        Err(e) => {
            error!(error = %e, "Configuration error");
            std::process::exit(1);
        }
    };

    if !settings.bus_url.starts_with("memory://") {
        // All five stages run in this process; the in-process bus is the
        // only transport this binary ships.
        error!(bus_url = %settings.bus_url, "Unsupported bus transport");
        std::process::exit(1);
    }

    // A real columnar store must answer before the pipeline starts;
    // unreachable for the whole probe window is exit code 2.
    if !settings.store_is_memory() {
        let store: SharedStore = match HttpColumnStore::new(
            &settings.store_url,
            settings.store_user.clone(),
            settings.store_pass.clone(),
        ) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Configuration error");
                std::process::exit(1);
            }
        };
        if !probe_dependencies(&store, Duration::from_secs(args.probe_timeout_secs)).await {
            std::process::exit(2);
        }
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown.cancel();
    });

    let watch_path = policy_path.filter(|p| p.exists());
    if let Err(e) = run_pipeline(settings, policy, server_addr, watch_path, cancel).await {
        error!(error = %e, "Pipeline terminated with error");
        std::process::exit(1);
    }

    info!("Tidewatch shutdown complete");
}
