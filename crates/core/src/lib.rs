//! dfm 공통 크레이트
//!
//! 워크스페이스의 모든 크레이트가 공유하는 에러, 설정, 생명주기 trait,
//! 도메인 타입, 메트릭 이름을 정의합니다.
//!
//! - [`error`]: 최상위 에러 (`DfmError`)와 도메인별 에러
//! - [`config`]: `dfm.toml` 설정 모델 (`DfmConfig`)
//! - [`pipeline`]: 모듈 생명주기 trait (`Pipeline`, `HealthStatus`)
//! - [`types`]: 공유 도메인 타입 (`ContainerInfo`)
//! - [`metrics`]: 메트릭 이름 상수

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod types;

// 에러
pub use error::{ConfigError, DfmError, FirewallError, PipelineError};

// 설정
pub use config::DfmConfig;

// 파이프라인 trait
pub use pipeline::{HealthStatus, Pipeline};

// 도메인 타입
pub use types::ContainerInfo;
