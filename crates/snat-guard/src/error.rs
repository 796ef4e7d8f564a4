//! SNAT 가드 에러 타입
//!
//! [`SnatGuardError`]는 SNAT 가드 내부에서 발생하는 모든 에러를 표현합니다.
//! `From<SnatGuardError> for DfmError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.

use dfm_core::error::{ConfigError, DfmError, FirewallError, PipelineError};

/// SNAT 가드 도메인 에러
///
/// 이벤트 하나를 처리하다 생긴 에러는 그 이벤트에서 끝나며 루프를 멈추지 않습니다.
/// 시작 시점의 `DockerConnection`만 치명적입니다.
#[derive(Debug, thiserror::Error)]
pub enum SnatGuardError {
    /// Docker 소켓 연결 실패
    #[error("docker connection error: {0}")]
    DockerConnection(String),

    /// Docker API 호출 실패
    #[error("docker api error: {0}")]
    DockerApi(String),

    /// 컨테이너를 찾을 수 없음 (이미 종료됨)
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// 컨테이너는 있지만 SNAT 주소를 만들 수 없음
    #[error("cannot resolve addresses for container '{container}': {reason}")]
    AddressResolution {
        /// 대상 컨테이너 이름
        container: String,
        /// 실패 사유
        reason: String,
    },

    /// 룰 도구 실행 실패, 비정상 종료, 타임아웃
    #[error("rule store unavailable: {0}")]
    StoreUnavailable(String),

    /// 룰 테이블 내용을 해석할 수 없음
    #[error("corrupt rule set at line {line}: {reason}")]
    CorruptRuleSet {
        /// 1부터 시작하는 줄 번호
        line: usize,
        /// 해석 실패 사유
        reason: String,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),
}

impl SnatGuardError {
    /// 룰 테이블 연산 실패 여부 (StoreUnavailable / CorruptRuleSet)
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::CorruptRuleSet { .. })
    }
}

impl From<SnatGuardError> for DfmError {
    fn from(err: SnatGuardError) -> Self {
        match err {
            SnatGuardError::DockerConnection(msg) | SnatGuardError::DockerApi(msg) => {
                DfmError::Container(msg)
            }
            SnatGuardError::ContainerNotFound(name) => {
                DfmError::Container(format!("container not found: {name}"))
            }
            err @ SnatGuardError::AddressResolution { .. } => DfmError::Container(err.to_string()),
            SnatGuardError::StoreUnavailable(msg) => {
                DfmError::Firewall(FirewallError::StoreUnavailable(msg))
            }
            SnatGuardError::CorruptRuleSet { line, reason } => {
                DfmError::Firewall(FirewallError::CorruptRuleSet { line, reason })
            }
            SnatGuardError::Config { field, reason } => {
                DfmError::Config(ConfigError::InvalidValue { field, reason })
            }
            SnatGuardError::Channel(msg) => DfmError::Pipeline(PipelineError::Channel(msg)),
        }
    }
}
