//! Integration tests for metrics server functionality.

use dfm_core::config::MetricsConfig;
use dfm_daemon::metrics_server;
use serial_test::serial;

#[test]
#[serial]
fn test_install_metrics_recorder_fails_with_invalid_address() {
    let config = MetricsConfig {
        enabled: true,
        listen_addr: "999.999.999.999".to_string(),
        port: 9469,
        endpoint: "/metrics".to_string(),
    };

    let result = metrics_server::install_metrics_recorder(&config);

    assert!(
        result.is_err(),
        "install_metrics_recorder should fail with invalid address"
    );
}

#[test]
#[serial]
fn test_install_metrics_recorder_rejects_unsupported_endpoint() {
    let config = MetricsConfig {
        enabled: true,
        listen_addr: "127.0.0.1".to_string(),
        port: 19469,
        endpoint: "/custom".to_string(),
    };

    let err = metrics_server::install_metrics_recorder(&config)
        .expect_err("custom endpoint should be rejected");
    assert!(err.to_string().contains("/custom"));
}

#[tokio::test]
#[serial]
async fn test_install_metrics_recorder_succeeds_once() {
    let config = MetricsConfig {
        enabled: true,
        listen_addr: "127.0.0.1".to_string(),
        port: 19470,
        endpoint: "/metrics".to_string(),
    };

    let first = metrics_server::install_metrics_recorder(&config);
    assert!(first.is_ok(), "first install should succeed: {:?}", first.err());

    // 전역 recorder는 프로세스당 하나
    let second = metrics_server::install_metrics_recorder(&MetricsConfig {
        port: 19471,
        ..config
    });
    assert!(second.is_err(), "second install should fail");
}
