//! 설정 관리 -- dfm.toml 파싱 및 런타임 설정
//!
//! [`DfmConfig`]는 모든 모듈의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`DFM_DOCKER_BRIDGE=br0` 형식)
//! 3. 설정 파일 (`dfm.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), dfm_core::error::DfmError> {
//! use dfm_core::config::DfmConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = DfmConfig::load("dfm.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = DfmConfig::parse("[docker]\nbridge = \"mc-net\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, DfmError};

/// dfm 통합 설정
///
/// `dfm.toml` 파일의 최상위 구조를 나타냅니다.
/// 각 모듈은 자기 섹션만 읽어 사용합니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DfmConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// Docker 연결 및 컨테이너 식별 설정
    #[serde(default)]
    pub docker: DockerConfig,
    /// 방화벽 룰 도구 설정
    #[serde(default)]
    pub firewall: FirewallConfig,
    /// 재조정(reconcile) 루프 설정
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// 메트릭 엔드포인트 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl DfmConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    ///
    /// 검증은 CLI 오버라이드까지 적용한 뒤 호출자가 수행합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DfmError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// 파일이 없으면 기본값에서 시작한다는 점만 [`load`](Self::load)와 다릅니다.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self, DfmError> {
        let mut config = match Self::from_file(path.as_ref()).await {
            Ok(config) => config,
            Err(DfmError::Config(ConfigError::FileNotFound { path })) => {
                warn!(path = %path, "config file not found, using defaults");
                Self::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, DfmError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DfmError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                DfmError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, DfmError> {
        toml::from_str(toml_str).map_err(|e| {
            DfmError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `DFM_{SECTION}_{FIELD}`
    /// 예: `DFM_DOCKER_BRIDGE=mc-net`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "DFM_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "DFM_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.pid_file, "DFM_GENERAL_PID_FILE");

        // Docker
        override_string(&mut self.docker.socket, "DFM_DOCKER_SOCKET");
        override_string(&mut self.docker.bridge, "DFM_DOCKER_BRIDGE");
        override_string(&mut self.docker.name_pattern, "DFM_DOCKER_NAME_PATTERN");
        override_u64(
            &mut self.docker.inspect_timeout_secs,
            "DFM_DOCKER_INSPECT_TIMEOUT_SECS",
        );

        // Firewall
        override_string(&mut self.firewall.save_binary, "DFM_FIREWALL_SAVE_BINARY");
        override_string(
            &mut self.firewall.restore_binary,
            "DFM_FIREWALL_RESTORE_BINARY",
        );
        override_string(
            &mut self.firewall.iptables_binary,
            "DFM_FIREWALL_IPTABLES_BINARY",
        );
        override_string(&mut self.firewall.chain, "DFM_FIREWALL_CHAIN");
        override_string(&mut self.firewall.tag_prefix, "DFM_FIREWALL_TAG_PREFIX");
        override_u64(
            &mut self.firewall.command_timeout_secs,
            "DFM_FIREWALL_COMMAND_TIMEOUT_SECS",
        );
        override_bool(&mut self.firewall.wait_lock, "DFM_FIREWALL_WAIT_LOCK");

        // Reconcile
        override_u64(
            &mut self.reconcile.prune_interval_ms,
            "DFM_RECONCILE_PRUNE_INTERVAL_MS",
        );
        override_bool(
            &mut self.reconcile.sync_on_start,
            "DFM_RECONCILE_SYNC_ON_START",
        );
        override_usize(
            &mut self.reconcile.event_channel_capacity,
            "DFM_RECONCILE_EVENT_CHANNEL_CAPACITY",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "DFM_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "DFM_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "DFM_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), DfmError> {
        // log_level 검증
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        // log_format 검증
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.docker.bridge.trim().is_empty() {
            return Err(invalid(
                "docker.bridge",
                "bridge network name is required (config, DFM_DOCKER_BRIDGE or CLI argument)",
            ));
        }

        if self.docker.socket.is_empty() {
            return Err(invalid("docker.socket", "must not be empty"));
        }

        if self.docker.name_pattern.is_empty() {
            return Err(invalid("docker.name_pattern", "must not be empty"));
        }

        if self.docker.inspect_timeout_secs == 0 {
            return Err(invalid("docker.inspect_timeout_secs", "must be greater than 0"));
        }

        for (field, value) in [
            ("firewall.save_binary", &self.firewall.save_binary),
            ("firewall.restore_binary", &self.firewall.restore_binary),
            ("firewall.iptables_binary", &self.firewall.iptables_binary),
            ("firewall.chain", &self.firewall.chain),
        ] {
            if value.is_empty() {
                return Err(invalid(field, "must not be empty"));
            }
        }

        // 태그는 iptables comment 토큰 하나로 저장되므로 공백/따옴표를 허용하지 않음
        if self.firewall.tag_prefix.is_empty()
            || self
                .firewall
                .tag_prefix
                .chars()
                .any(|c| c.is_whitespace() || c == '"' || c == '\'')
        {
            return Err(invalid(
                "firewall.tag_prefix",
                "must be non-empty and contain no whitespace or quotes",
            ));
        }

        if self.firewall.command_timeout_secs == 0 {
            return Err(invalid(
                "firewall.command_timeout_secs",
                "must be greater than 0",
            ));
        }

        if self.reconcile.event_channel_capacity == 0 {
            return Err(invalid(
                "reconcile.event_channel_capacity",
                "must be greater than 0",
            ));
        }

        if self.metrics.enabled && self.metrics.endpoint != "/metrics" {
            return Err(invalid(
                "metrics.endpoint",
                "only '/metrics' is currently supported",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> DfmError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
    .into()
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// PID 파일 경로 (빈 문자열이면 사용하지 않음)
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
            pid_file: String::new(),
        }
    }
}

/// Docker 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker 소켓 경로
    pub socket: String,
    /// 컨테이너가 연결된 브리지 네트워크 이름
    pub bridge: String,
    /// 관리 대상 컨테이너 이름 패턴 (정규식, 전체 일치)
    pub name_pattern: String,
    /// 컨테이너 inspect 타임아웃 (초)
    pub inspect_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: "/var/run/docker.sock".to_owned(),
            bridge: String::new(),
            name_pattern: "^mc[0-9]+$".to_owned(),
            inspect_timeout_secs: 10,
        }
    }
}

/// 방화벽 룰 도구 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// 테이블 덤프 도구
    pub save_binary: String,
    /// 테이블 복원 도구
    pub restore_binary: String,
    /// 단일 룰 삽입 도구
    pub iptables_binary: String,
    /// SNAT 룰을 넣을 체인
    pub chain: String,
    /// 룰 comment에 박히는 태그 접두어
    pub tag_prefix: String,
    /// 도구 실행 타임아웃 (초)
    pub command_timeout_secs: u64,
    /// xtables 락 대기 여부 (`-w`)
    pub wait_lock: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            save_binary: "iptables-save".to_owned(),
            restore_binary: "iptables-restore".to_owned(),
            iptables_binary: "iptables".to_owned(),
            chain: "POSTROUTING".to_owned(),
            tag_prefix: "dfm_rule_".to_owned(),
            command_timeout_secs: 10,
            wait_lock: true,
        }
    }
}

/// 재조정 루프 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// prune 최소 간격 (밀리초)
    pub prune_interval_ms: u64,
    /// 이벤트 처리 전 전체 동기화 수행 여부
    pub sync_on_start: bool,
    /// 이벤트 채널 용량
    pub event_channel_capacity: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            prune_interval_ms: 1500,
            sync_on_start: true,
            event_channel_capacity: 256,
        }
    }
}

/// 메트릭 엔드포인트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 바인드 주소
    pub listen_addr: String,
    /// 포트
    pub port: u16,
    /// 스크레이프 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9469,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}
