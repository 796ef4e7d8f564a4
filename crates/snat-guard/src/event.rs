//! Container lifecycle events.
//!
//! [`ContainerEvent`] is what an [`EventSource`](crate::source::EventSource)
//! yields: a container name plus the status the runtime reported for it.
//! Only `start` and `die` drive the reconciler; every other status maps to
//! [`ContainerEventKind::Other`] and is ignored.
//!
//! # Examples
//!
//! ```
//! use dfm_snat_guard::{ContainerEvent, ContainerEventKind};
//!
//! let event = ContainerEvent::from_status("mc1", "start");
//! assert_eq!(event.kind, ContainerEventKind::Start);
//!
//! let event = ContainerEvent::from_status("mc1", "health_status: healthy");
//! assert!(matches!(event.kind, ContainerEventKind::Other(_)));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Container lifecycle event kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerEventKind {
    /// 컨테이너 시작됨
    Start,
    /// 컨테이너 프로세스 종료됨
    Die,
    /// 그 밖의 상태 (원래 상태 문자열 보존)
    Other(String),
}

impl ContainerEventKind {
    /// Maps a runtime status string to a kind.
    pub fn from_status(status: &str) -> Self {
        match status {
            "start" => Self::Start,
            "die" => Self::Die,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Label value used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Die => "die",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Display for ContainerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Die => write!(f, "die"),
            Self::Other(status) => write!(f, "other({status})"),
        }
    }
}

/// Docker container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEvent {
    /// 대상 컨테이너 이름
    pub name: String,
    /// 이벤트 종류
    pub kind: ContainerEventKind,
}

impl ContainerEvent {
    pub fn new(name: impl Into<String>, kind: ContainerEventKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn start(name: impl Into<String>) -> Self {
        Self::new(name, ContainerEventKind::Start)
    }

    pub fn die(name: impl Into<String>) -> Self {
        Self::new(name, ContainerEventKind::Die)
    }

    pub fn from_status(name: impl Into<String>, status: &str) -> Self {
        Self::new(name, ContainerEventKind::from_status(status))
    }
}

impl fmt::Display for ContainerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerEvent container={} kind={}", self.name, self.kind)
    }
}
