//! 파이프라인 trait -- 모듈 생명주기 정의

use std::fmt;
use std::future::Future;

use serde::Serialize;

use crate::error::DfmError;

/// 모듈 헬스 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    /// 정상
    Healthy,
    /// 동작하지만 일부 기능 저하
    Degraded(String),
    /// 비정상
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// 장기 실행 모듈의 생명주기 trait
///
/// `dfm-daemon`은 이 trait을 통해 모듈을 시작/정지하고 상태를 조회합니다.
pub trait Pipeline: Send {
    /// 백그라운드 처리를 시작합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), DfmError>> + Send;

    /// 처리를 정지하고 소유한 리소스를 해제합니다.
    fn stop(&mut self) -> impl Future<Output = Result<(), DfmError>> + Send;

    /// 현재 헬스 상태를 반환합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}
