//! Docker API abstraction for testability.
//!
//! The [`DockerClient`] trait abstracts the bollard Docker API, allowing
//! production code to use [`BollardDockerClient`] while tests use `MockDockerClient`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │ DockerAddressResolver│
//! └──────────┬───────────┘
//!            │
//!            ▼
//!     ┌─────────────┐
//!     │DockerClient │ (trait)
//!     └─────────────┘
//!        │      │
//!        ▼      ▼
//!   ┌───────┐ ┌────┐
//!   │Bollard│ │Mock│
//!   └───┬───┘ └────┘
//!       │
//!       ▼
//!   Docker Daemon
//! ```
//!
//! The event feed is not part of this trait; see
//! [`DockerEventSource`](crate::source::DockerEventSource), which shares the
//! same connection through [`BollardDockerClient::handle`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use bollard::errors::Error as BollardError;

use dfm_core::types::ContainerInfo;

use crate::error::SnatGuardError;

/// Docker API 연결 타임아웃 (초)
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Network attachment of one container, detached from bollard's model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerNetworks {
    /// Published container ports (`"25565/tcp"`) to the host addresses they are bound on.
    pub port_bindings: BTreeMap<String, Vec<String>>,
    /// Network name to the address assigned on it. Empty when unassigned.
    pub addresses: BTreeMap<String, String>,
}

/// Trait abstracting Docker API operations.
///
/// # Error Handling
///
/// - **404 errors**: Converted to `SnatGuardError::ContainerNotFound`
/// - **Connection errors**: Wrapped as `SnatGuardError::DockerConnection`
/// - **Everything else**: Wrapped as `SnatGuardError::DockerApi`
pub trait DockerClient: Send + Sync + 'static {
    /// Lists running containers.
    ///
    /// Names are returned without the leading `/`.
    fn list_running(
        &self,
    ) -> impl Future<Output = Result<Vec<ContainerInfo>, SnatGuardError>> + Send;

    /// Inspects a container by name and returns its network attachment.
    ///
    /// # Errors
    ///
    /// - `SnatGuardError::ContainerNotFound`: Container does not exist (404)
    /// - `SnatGuardError::DockerApi`: Other API errors
    fn inspect_networks(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<ContainerNetworks, SnatGuardError>> + Send;

    /// Checks Docker daemon connectivity.
    fn ping(&self) -> impl Future<Output = Result<(), SnatGuardError>> + Send;
}

/// Production Docker client implementation using `bollard`.
///
/// Internally uses `Arc<bollard::Docker>` so the event source can share the
/// same connection.
#[derive(Clone)]
pub struct BollardDockerClient {
    docker: Arc<bollard::Docker>,
}

impl BollardDockerClient {
    /// Connects to Docker using a specific socket path.
    pub fn connect_with_socket(socket_path: &str) -> Result<Self, SnatGuardError> {
        let docker = bollard::Docker::connect_with_socket(
            socket_path,
            CONNECT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| {
            SnatGuardError::DockerConnection(format!(
                "failed to connect to docker at {socket_path}: {e}"
            ))
        })?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    /// Shared handle to the underlying connection.
    pub fn handle(&self) -> Arc<bollard::Docker> {
        Arc::clone(&self.docker)
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl DockerClient for BollardDockerClient {
    async fn list_running(&self) -> Result<Vec<ContainerInfo>, SnatGuardError> {
        use bollard::container::ListContainersOptions;

        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| SnatGuardError::DockerApi(format!("list containers failed: {e}")))?;

        let mut result = Vec::with_capacity(containers.len());
        for container in containers {
            let name = container
                .names
                .unwrap_or_default()
                .first()
                .map(|n| n.trim_start_matches('/').to_owned())
                .unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            result.push(ContainerInfo {
                id: container.id.unwrap_or_default(),
                name,
                status: container.state.unwrap_or_default(),
            });
        }

        Ok(result)
    }

    async fn inspect_networks(&self, name: &str) -> Result<ContainerNetworks, SnatGuardError> {
        use bollard::container::InspectContainerOptions;

        let details = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    SnatGuardError::ContainerNotFound(name.to_owned())
                } else {
                    SnatGuardError::DockerApi(format!("inspect container failed: {e}"))
                }
            })?;

        let Some(settings) = details.network_settings else {
            return Ok(ContainerNetworks::default());
        };

        let port_bindings = settings
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|(port, bindings)| {
                let hosts = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|b| b.host_ip)
                    .collect();
                (port, hosts)
            })
            .collect();

        let addresses = settings
            .networks
            .unwrap_or_default()
            .into_iter()
            .map(|(network, endpoint)| (network, endpoint.ip_address.unwrap_or_default()))
            .collect();

        Ok(ContainerNetworks {
            port_bindings,
            addresses,
        })
    }

    async fn ping(&self) -> Result<(), SnatGuardError> {
        self.docker
            .ping()
            .await
            .map_err(|e| SnatGuardError::DockerConnection(format!("ping failed: {e}")))?;
        Ok(())
    }
}

/// 테스트용 Mock Docker 클라이언트
///
/// 설정 가능한 응답을 반환하여 Docker 없이도 테스트할 수 있습니다.
#[cfg(test)]
#[derive(Default)]
pub struct MockDockerClient {
    /// list_running 호출 시 반환할 컨테이너 목록
    pub containers: Vec<ContainerInfo>,
    /// 이름별 네트워크 정보
    pub networks: std::collections::HashMap<String, ContainerNetworks>,
    /// ping 실패 시뮬레이션
    pub fail_ping: bool,
    /// list_running 실패 시뮬레이션
    pub fail_list: bool,
}

#[cfg(test)]
impl MockDockerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 실행 중인 컨테이너와 네트워크 정보를 함께 추가합니다.
    ///
    /// `external`은 `25565/tcp` 포트 바인딩, `internal`은 `bridge` 네트워크 주소가 됩니다.
    pub fn with_container(mut self, name: &str, external: &str, internal: &str) -> Self {
        self.containers.push(ContainerInfo {
            id: format!("{:0>12}", self.containers.len()),
            name: name.to_owned(),
            status: "running".to_owned(),
        });
        self.networks.insert(
            name.to_owned(),
            ContainerNetworks {
                port_bindings: BTreeMap::from([(
                    "25565/tcp".to_owned(),
                    vec![external.to_owned()],
                )]),
                addresses: BTreeMap::from([("bridge".to_owned(), internal.to_owned())]),
            },
        );
        self
    }

    /// 네트워크 정보를 직접 지정합니다 (실행 목록에는 넣지 않음).
    pub fn with_networks(mut self, name: &str, networks: ContainerNetworks) -> Self {
        self.networks.insert(name.to_owned(), networks);
        self
    }

    pub fn with_failing_ping(mut self) -> Self {
        self.fail_ping = true;
        self
    }

    pub fn with_failing_list(mut self) -> Self {
        self.fail_list = true;
        self
    }
}

#[cfg(test)]
impl DockerClient for MockDockerClient {
    async fn list_running(&self) -> Result<Vec<ContainerInfo>, SnatGuardError> {
        if self.fail_list {
            return Err(SnatGuardError::DockerApi("mock list failure".to_owned()));
        }
        Ok(self.containers.clone())
    }

    async fn inspect_networks(&self, name: &str) -> Result<ContainerNetworks, SnatGuardError> {
        self.networks
            .get(name)
            .cloned()
            .ok_or_else(|| SnatGuardError::ContainerNotFound(name.to_owned()))
    }

    async fn ping(&self) -> Result<(), SnatGuardError> {
        if self.fail_ping {
            return Err(SnatGuardError::DockerConnection("mock ping failure".to_owned()));
        }
        Ok(())
    }
}
