//! Incident API (stage A).
//!
//! The terminal sink of the fast path and the operational query surface:
//! persists incidents append-only and serves health, metrics, stats, trace
//! and incident CRUD over HTTP. Query endpoints never mutate state;
//! user-visible failures are RFC 7807 problem JSON.

pub mod handlers;
mod persist;
mod problem;
mod routes;
mod state;

pub use persist::IncidentPersister;
pub use problem::Problem;
pub use routes::create_app;
pub use state::ApiState;
