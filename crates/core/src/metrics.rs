//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`
//! 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `dfm_`
//! - 모듈명: `snat_`, `daemon_`
//! - 접미어: `_total` (counter), `_seconds` (gauge/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(dfm_core::metrics::SNAT_RULES_ADDED_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 실패한 룰 테이블 연산 레이블 키 (add, remove, prune, sync)
pub const LABEL_OP: &str = "op";

/// 이벤트 종류 레이블 키 (start, die, other)
pub const LABEL_EVENT_KIND: &str = "kind";

// ─── SNAT Guard 메트릭 ─────────────────────────────────────────────

/// SNAT: 추가된 룰 수 (counter)
pub const SNAT_RULES_ADDED_TOTAL: &str = "dfm_snat_rules_added_total";

/// SNAT: 제거된 룰 수 (counter, Die 이벤트와 prune 모두 포함)
pub const SNAT_RULES_REMOVED_TOTAL: &str = "dfm_snat_rules_removed_total";

/// SNAT: 실행된 prune 수 (counter)
pub const SNAT_PRUNES_EXECUTED_TOTAL: &str = "dfm_snat_prunes_executed_total";

/// SNAT: rate limit으로 건너뛴 prune 수 (counter)
pub const SNAT_PRUNES_SKIPPED_TOTAL: &str = "dfm_snat_prunes_skipped_total";

/// SNAT: 처리된 컨테이너 이벤트 수 (counter, label: kind)
pub const SNAT_EVENTS_PROCESSED_TOTAL: &str = "dfm_snat_events_processed_total";

/// SNAT: 실패한 룰 테이블 연산 수 (counter, label: op)
pub const SNAT_OPERATION_FAILURES_TOTAL: &str = "dfm_snat_operation_failures_total";

/// SNAT: 주소 조회 중 사라진 컨테이너 수 (counter)
pub const SNAT_RESOLUTION_RACES_TOTAL: &str = "dfm_snat_resolution_races_total";

/// SNAT: 현재 소유 중인 룰 수 (gauge)
pub const SNAT_OWNED_RULES: &str = "dfm_snat_owned_rules";

// ─── Daemon 메트릭 ─────────────────────────────────────────────────

/// Daemon: 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "dfm_daemon_uptime_seconds";

/// Daemon: 빌드 정보 (gauge, 항상 1)
pub const DAEMON_BUILD_INFO: &str = "dfm_daemon_build_info";

/// 모든 메트릭의 설명을 등록합니다.
///
/// recorder 설치 직후 한 번 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    // SNAT Guard
    describe_counter!(SNAT_RULES_ADDED_TOTAL, "SNAT rules inserted for started containers");
    describe_counter!(
        SNAT_RULES_REMOVED_TOTAL,
        "SNAT rules removed on container death or by prune"
    );
    describe_counter!(
        SNAT_PRUNES_EXECUTED_TOTAL,
        "Full-table prune passes that ran"
    );
    describe_counter!(
        SNAT_PRUNES_SKIPPED_TOTAL,
        "Prune attempts suppressed by the rate limiter"
    );
    describe_counter!(
        SNAT_EVENTS_PROCESSED_TOTAL,
        "Container lifecycle events consumed (by kind)"
    );
    describe_counter!(
        SNAT_OPERATION_FAILURES_TOTAL,
        "Rule table operations that failed (by op)"
    );
    describe_counter!(
        SNAT_RESOLUTION_RACES_TOTAL,
        "Containers that vanished before their addresses could be resolved"
    );
    describe_gauge!(SNAT_OWNED_RULES, "SNAT rules currently owned by dfm");

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Daemon uptime in seconds");
    describe_gauge!(DAEMON_BUILD_INFO, "Build information (always 1)");
}
