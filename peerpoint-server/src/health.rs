//! Health check endpoints for Kubernetes probes.
//!
//! - `/health/live` - Liveness probe (restart if fails)
//! - `/health/ready` - Readiness probe (remove from LB if fails)

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::AppState;

/// Health status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// Overall status: "healthy" or "unhealthy"
    pub status: &'static str,
    /// Server version
    pub version: &'static str,
    /// Relay mode
    pub mode: String,
    /// Connected clients
    pub sessions: usize,
    /// Individual component checks
    pub checks: HealthChecks,
}

/// Individual health checks.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Session registry lock is usable
    pub registry: bool,
    /// Hub replica lock is usable (always true in forward mode)
    pub replica: bool,
}

/// Liveness probe - is the server running?
#[tracing::instrument(name = "liveness_probe")]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe - is the server ready to accept clients?
///
/// A poisoned registry or replica lock means some session task panicked
/// mid-update; the process keeps serving but reports itself unready.
#[tracing::instrument(name = "readiness_probe", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let registry_ok = state.relay.registry().is_healthy();
    let replica_ok = state.relay.replica_is_healthy();
    let all_ok = registry_ok && replica_ok;

    let status = HealthStatus {
        status: if all_ok { "healthy" } else { "unhealthy" },
        version: env!("CARGO_PKG_VERSION"),
        mode: state.relay.mode().to_string(),
        sessions: state.relay.registry().len(),
        checks: HealthChecks {
            registry: registry_ok,
            replica: replica_ok,
        },
    };

    let code = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(status))
}
