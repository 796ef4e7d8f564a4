//! Daemon health reporting.
//!
//! The orchestrator polls the guard's `health_check()` on a fixed interval
//! and logs a [`DaemonHealth`] snapshot. Transitions are logged at `warn`,
//! steady state at `debug`.

use serde::Serialize;

use dfm_core::pipeline::HealthStatus;

/// Health snapshot for the whole daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Guard health status.
    pub status: HealthStatus,
    /// Seconds since the daemon started.
    pub uptime_secs: u64,
    /// Guard lifecycle state (initialized, running, stopped).
    pub guard_state: String,
    /// Container events handled so far.
    pub events_processed: u64,
    /// Container events whose handling failed.
    pub operation_failures: u64,
}

/// Logs `current`, at `warn` when the status changed from `previous`.
pub fn log_health(previous: Option<&HealthStatus>, current: &DaemonHealth) {
    let changed = previous.is_some_and(|p| p != &current.status);
    if changed || (previous.is_none() && !current.status.is_healthy()) {
        tracing::warn!(
            status = %current.status,
            events_processed = current.events_processed,
            operation_failures = current.operation_failures,
            "daemon health changed"
        );
    } else {
        tracing::debug!(
            status = %current.status,
            uptime_secs = current.uptime_secs,
            events_processed = current.events_processed,
            "health check"
        );
    }
}
