//! 에러 타입 -- 도메인별 에러 정의

/// dfm 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum DfmError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 파이프라인 생명주기 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// 컨테이너 런타임 에러
    #[error("container runtime error: {0}")]
    Container(String),

    /// 방화벽 룰 테이블 에러
    #[error("firewall error: {0}")]
    Firewall(#[from] FirewallError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 파이프라인 생명주기 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 이미 실행 중
    #[error("pipeline already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline not running")]
    NotRunning,

    /// 파이프라인 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),

    /// 채널 통신 실패
    #[error("channel error: {0}")]
    Channel(String),
}

/// 방화벽 룰 테이블 에러
#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    /// 룰 도구 실행 실패 또는 비정상 종료
    #[error("rule store unavailable: {0}")]
    StoreUnavailable(String),

    /// 룰 테이블 내용을 해석할 수 없음
    #[error("corrupt rule set at line {line}: {reason}")]
    CorruptRuleSet { line: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_to_dfm_error() {
        let err: DfmError = ConfigError::InvalidValue {
            field: "docker.bridge".to_owned(),
            reason: "must not be empty".to_owned(),
        }
        .into();
        assert!(matches!(err, DfmError::Config(_)));
        assert!(err.to_string().contains("docker.bridge"));
    }

    #[test]
    fn firewall_error_display() {
        let err = FirewallError::CorruptRuleSet {
            line: 7,
            reason: "unexpected token".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("line 7"));
        assert!(msg.contains("unexpected token"));
    }

    #[test]
    fn pipeline_error_display() {
        assert_eq!(
            PipelineError::AlreadyRunning.to_string(),
            "pipeline already running"
        );
        let err: DfmError = PipelineError::NotRunning.into();
        assert!(err.to_string().contains("not running"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: DfmError = io.into();
        assert!(matches!(err, DfmError::Io(_)));
    }
}
