//! SNAT 가드 설정
//!
//! [`SnatGuardConfig`]는 core의 [`DfmConfig`](dfm_core::config::DfmConfig)에서
//! docker / firewall / reconcile 섹션을 모아 가드 하나가 쓰는 평평한 설정으로 만듭니다.
//!
//! # 사용 예시
//! ```ignore
//! use dfm_core::config::DfmConfig;
//! use dfm_snat_guard::config::SnatGuardConfig;
//!
//! let core_config = DfmConfig::default();
//! let config = SnatGuardConfig::from_core(&core_config);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use dfm_core::config::DfmConfig;

use crate::error::SnatGuardError;
use crate::rule::DEFAULT_TAG_PREFIX;

/// SNAT 가드 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnatGuardConfig {
    /// Docker 소켓 경로
    pub docker_socket: String,
    /// 내부 주소를 읽을 브리지 네트워크 이름
    pub bridge: String,
    /// 관리 대상 이름 패턴 (정규식)
    pub name_pattern: String,
    /// 컨테이너 조회 타임아웃 (초)
    pub inspect_timeout_secs: u64,

    /// 테이블 덤프 도구
    pub save_binary: String,
    /// 테이블 복원 도구
    pub restore_binary: String,
    /// 단일 룰 삽입 도구
    pub iptables_binary: String,
    /// SNAT 룰 체인
    pub chain: String,
    /// 태그 접두어
    pub tag_prefix: String,
    /// 룰 도구 실행 타임아웃 (초)
    pub command_timeout_secs: u64,
    /// xtables 락 대기 여부
    pub wait_lock: bool,

    /// prune 최소 간격 (밀리초)
    pub prune_interval_ms: u64,
    /// 이벤트 처리 전 전체 동기화
    pub sync_on_start: bool,
    /// 이벤트 채널 용량
    pub event_channel_capacity: usize,
}

impl Default for SnatGuardConfig {
    fn default() -> Self {
        Self {
            docker_socket: "/var/run/docker.sock".to_owned(),
            bridge: "bridge".to_owned(),
            name_pattern: "^mc[0-9]+$".to_owned(),
            inspect_timeout_secs: 10,
            save_binary: "iptables-save".to_owned(),
            restore_binary: "iptables-restore".to_owned(),
            iptables_binary: "iptables".to_owned(),
            chain: "POSTROUTING".to_owned(),
            tag_prefix: DEFAULT_TAG_PREFIX.to_owned(),
            command_timeout_secs: 10,
            wait_lock: true,
            prune_interval_ms: 1500,
            sync_on_start: true,
            event_channel_capacity: 256,
        }
    }
}

/// 설정 상한값 상수
const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_PRUNE_INTERVAL_MS: u64 = 3_600_000;
const MAX_CHANNEL_CAPACITY: usize = 65_536;

fn config_error(field: &str, reason: impl Into<String>) -> SnatGuardError {
    SnatGuardError::Config {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

impl SnatGuardConfig {
    /// core 설정에서 가드 설정을 생성합니다.
    pub fn from_core(core: &DfmConfig) -> Self {
        Self {
            docker_socket: core.docker.socket.clone(),
            bridge: core.docker.bridge.clone(),
            name_pattern: core.docker.name_pattern.clone(),
            inspect_timeout_secs: core.docker.inspect_timeout_secs,
            save_binary: core.firewall.save_binary.clone(),
            restore_binary: core.firewall.restore_binary.clone(),
            iptables_binary: core.firewall.iptables_binary.clone(),
            chain: core.firewall.chain.clone(),
            tag_prefix: core.firewall.tag_prefix.clone(),
            command_timeout_secs: core.firewall.command_timeout_secs,
            wait_lock: core.firewall.wait_lock,
            prune_interval_ms: core.reconcile.prune_interval_ms,
            sync_on_start: core.reconcile.sync_on_start,
            event_channel_capacity: core.reconcile.event_channel_capacity,
        }
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.inspect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), SnatGuardError> {
        if self.bridge.trim().is_empty() {
            return Err(config_error("bridge", "must not be empty"));
        }

        if self.docker_socket.is_empty() {
            return Err(config_error("docker_socket", "must not be empty"));
        }

        regex::Regex::new(&self.name_pattern)
            .map_err(|e| config_error("name_pattern", format!("invalid regex: {e}")))?;

        if self.inspect_timeout_secs == 0 || self.inspect_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(config_error(
                "inspect_timeout_secs",
                format!("must be 1-{MAX_TIMEOUT_SECS}"),
            ));
        }

        if self.command_timeout_secs == 0 || self.command_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(config_error(
                "command_timeout_secs",
                format!("must be 1-{MAX_TIMEOUT_SECS}"),
            ));
        }

        for (field, value) in [
            ("save_binary", &self.save_binary),
            ("restore_binary", &self.restore_binary),
            ("iptables_binary", &self.iptables_binary),
            ("chain", &self.chain),
        ] {
            if value.trim().is_empty() {
                return Err(config_error(field, "must not be empty"));
            }
        }

        if self.tag_prefix.is_empty()
            || self
                .tag_prefix
                .chars()
                .any(|c| c.is_whitespace() || c == '"' || c == '\\')
        {
            return Err(config_error(
                "tag_prefix",
                "must be non-empty without whitespace, quotes or backslashes",
            ));
        }

        if self.prune_interval_ms > MAX_PRUNE_INTERVAL_MS {
            return Err(config_error(
                "prune_interval_ms",
                format!("must be 0-{MAX_PRUNE_INTERVAL_MS}"),
            ));
        }

        if self.event_channel_capacity == 0 || self.event_channel_capacity > MAX_CHANNEL_CAPACITY {
            return Err(config_error(
                "event_channel_capacity",
                format!("must be 1-{MAX_CHANNEL_CAPACITY}"),
            ));
        }

        Ok(())
    }
}

/// SNAT 가드 설정 빌더
#[derive(Default)]
pub struct SnatGuardConfigBuilder {
    config: SnatGuardConfig,
}

impl SnatGuardConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Docker 소켓 경로를 설정합니다.
    pub fn docker_socket(mut self, socket: impl Into<String>) -> Self {
        self.config.docker_socket = socket.into();
        self
    }

    /// 브리지 네트워크 이름을 설정합니다.
    pub fn bridge(mut self, bridge: impl Into<String>) -> Self {
        self.config.bridge = bridge.into();
        self
    }

    /// 관리 대상 이름 패턴을 설정합니다.
    pub fn name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.name_pattern = pattern.into();
        self
    }

    pub fn inspect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.inspect_timeout_secs = secs;
        self
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// 태그 접두어를 설정합니다.
    pub fn tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.tag_prefix = prefix.into();
        self
    }

    pub fn command_timeout_secs(mut self, secs: u64) -> Self {
        self.config.command_timeout_secs = secs;
        self
    }

    pub fn wait_lock(mut self, wait: bool) -> Self {
        self.config.wait_lock = wait;
        self
    }

    /// prune 최소 간격(밀리초)을 설정합니다.
    pub fn prune_interval_ms(mut self, ms: u64) -> Self {
        self.config.prune_interval_ms = ms;
        self
    }

    pub fn sync_on_start(mut self, sync: bool) -> Self {
        self.config.sync_on_start = sync;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    /// 설정을 검증하고 `SnatGuardConfig`를 생성합니다.
    pub fn build(self) -> Result<SnatGuardConfig, SnatGuardError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
