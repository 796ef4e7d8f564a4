//! 공유 도메인 타입

use std::fmt;

use serde::{Deserialize, Serialize};

/// 실행 중인 컨테이너 요약 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// 컨테이너 ID
    pub id: String,
    /// 컨테이너 이름 (선행 `/` 제거됨)
    pub name: String,
    /// 상태 (running 등)
    pub status: String,
}

impl fmt::Display for ContainerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) status={}",
            self.name,
            &self.id[..12.min(self.id.len())],
            self.status,
        )
    }
}
