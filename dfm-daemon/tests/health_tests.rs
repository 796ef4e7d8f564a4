//! Daemon health snapshot tests.

use dfm_core::pipeline::HealthStatus;
use dfm_daemon::health::{DaemonHealth, log_health};

fn snapshot(status: HealthStatus) -> DaemonHealth {
    DaemonHealth {
        status,
        uptime_secs: 42,
        guard_state: "running".to_owned(),
        events_processed: 7,
        operation_failures: 1,
    }
}

#[test]
fn test_health_serializes_to_json() {
    let health = snapshot(HealthStatus::Degraded("docker daemon not reachable".to_owned()));

    let json = serde_json::to_value(&health).expect("health should serialize");

    assert_eq!(json["uptime_secs"], 42);
    assert_eq!(json["guard_state"], "running");
    assert_eq!(json["events_processed"], 7);
    assert_eq!(json["operation_failures"], 1);
    assert_eq!(json["status"]["Degraded"], "docker daemon not reachable");
}

#[test]
fn test_healthy_status_serializes_as_string() {
    let json = serde_json::to_value(snapshot(HealthStatus::Healthy)).unwrap();
    assert_eq!(json["status"], "Healthy");
}

#[test]
fn test_log_health_accepts_every_transition() {
    let healthy = snapshot(HealthStatus::Healthy);
    let unhealthy = snapshot(HealthStatus::Unhealthy("container event feed closed".to_owned()));

    log_health(None, &healthy);
    log_health(None, &unhealthy);
    log_health(Some(&HealthStatus::Healthy), &unhealthy);
    log_health(Some(&unhealthy.status), &unhealthy);
}
