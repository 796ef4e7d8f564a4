//! Container address resolution.
//!
//! [`AddressResolver`] is the reconciler's only view of the container
//! runtime: it turns a container name into the [`AddressPair`] its SNAT rule
//! needs and reports which containers are running when a prune runs.
//!
//! A container that vanished between its event and the lookup is a normal
//! race. [`resolve`](AddressResolver::resolve) reports it as `Ok(None)`, not
//! as an error.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::docker::{ContainerNetworks, DockerClient};
use crate::error::SnatGuardError;
use crate::rule::AddressPair;

/// 기본 조회 타임아웃
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub trait AddressResolver: Send + Sync + 'static {
    /// Resolves the addresses of a running container.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(pair))`: container found with a published port and a bridge address
    /// - `Ok(None)`: container no longer exists
    ///
    /// # Errors
    ///
    /// - `SnatGuardError::AddressResolution`: container exists but the pair cannot be built
    /// - `SnatGuardError::DockerApi`: runtime API failure
    fn resolve(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<AddressPair>, SnatGuardError>> + Send;

    /// Names of every currently running container, managed or not.
    fn running(&self) -> impl Future<Output = Result<Vec<String>, SnatGuardError>> + Send;

    /// Checks that the runtime is reachable. Used for health reporting.
    fn ping(&self) -> impl Future<Output = Result<(), SnatGuardError>> + Send {
        async { Ok(()) }
    }
}

/// Resolver backed by the Docker API.
///
/// The bridge network name is fixed at construction.
pub struct DockerAddressResolver<D: DockerClient> {
    client: Arc<D>,
    bridge: String,
    timeout: Duration,
}

impl<D: DockerClient> DockerAddressResolver<D> {
    pub fn new(client: Arc<D>, bridge: impl Into<String>) -> Self {
        Self {
            client,
            bridge: bridge.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bounds every Docker call. An expired inspect counts as a vanished container.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }
}

impl<D: DockerClient> AddressResolver for DockerAddressResolver<D> {
    async fn resolve(&self, name: &str) -> Result<Option<AddressPair>, SnatGuardError> {
        let networks = match tokio::time::timeout(self.timeout, self.client.inspect_networks(name))
            .await
        {
            Ok(Ok(networks)) => networks,
            Ok(Err(SnatGuardError::ContainerNotFound(_))) => {
                debug!(container = name, "container vanished before inspection");
                return Ok(None);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(
                    container = name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "container inspection timed out"
                );
                return Ok(None);
            }
        };

        address_pair(name, &networks, &self.bridge).map(Some)
    }

    async fn running(&self) -> Result<Vec<String>, SnatGuardError> {
        let containers = tokio::time::timeout(self.timeout, self.client.list_running())
            .await
            .map_err(|_| SnatGuardError::DockerApi("list containers timed out".to_owned()))??;
        Ok(containers.into_iter().map(|c| c.name).collect())
    }

    async fn ping(&self) -> Result<(), SnatGuardError> {
        tokio::time::timeout(self.timeout, self.client.ping())
            .await
            .map_err(|_| SnatGuardError::DockerConnection("ping timed out".to_owned()))?
    }
}

/// Builds the SNAT address pair from a container's network attachment.
///
/// The external address is the host address of the first published port, in
/// port-key order, that is bound to a concrete IPv4 address. Wildcard and
/// IPv6 bindings are skipped.
pub fn address_pair(
    container: &str,
    networks: &ContainerNetworks,
    bridge: &str,
) -> Result<AddressPair, SnatGuardError> {
    let fail = |reason: String| SnatGuardError::AddressResolution {
        container: container.to_owned(),
        reason,
    };

    let external = networks
        .port_bindings
        .values()
        .flatten()
        .filter_map(|host| host.parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_unspecified())
        .ok_or_else(|| fail("no published port bound to a specific IPv4 host address".to_owned()))?;

    let internal = match networks.addresses.get(bridge).map(String::as_str) {
        None => return Err(fail(format!("not attached to network '{bridge}'"))),
        Some("") => return Err(fail(format!("no address assigned on network '{bridge}'"))),
        Some(raw) => raw
            .parse::<Ipv4Addr>()
            .map_err(|_| fail(format!("unparsable address '{raw}' on network '{bridge}'")))?,
    };

    Ok(AddressPair { external, internal })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::docker::MockDockerClient;

    fn networks(ports: &[(&str, Vec<&str>)], addresses: &[(&str, &str)]) -> ContainerNetworks {
        ContainerNetworks {
            port_bindings: ports
                .iter()
                .map(|(p, hosts)| (p.to_string(), hosts.iter().map(|h| h.to_string()).collect()))
                .collect(),
            addresses: addresses
                .iter()
                .map(|(n, a)| (n.to_string(), a.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn resolves_running_container() {
        let client = Arc::new(MockDockerClient::new().with_container("mc1", "10.0.0.5", "172.17.0.2"));
        let resolver = DockerAddressResolver::new(client, "bridge");

        let pair = resolver.resolve("mc1").await.unwrap().unwrap();
        assert_eq!(pair.internal, Ipv4Addr::new(172, 17, 0, 2));
        assert_eq!(pair.external, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[tokio::test]
    async fn vanished_container_is_none() {
        let resolver = DockerAddressResolver::new(Arc::new(MockDockerClient::new()), "bridge");
        assert!(resolver.resolve("mc1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_lists_every_name() {
        let client = Arc::new(
            MockDockerClient::new()
                .with_container("mc1", "10.0.0.5", "172.17.0.2")
                .with_container("web", "10.0.0.6", "172.17.0.3"),
        );
        let resolver = DockerAddressResolver::new(client, "bridge");
        assert_eq!(resolver.running().await.unwrap(), vec!["mc1", "web"]);
    }

    #[tokio::test]
    async fn running_propagates_list_failure() {
        let client = Arc::new(MockDockerClient::new().with_failing_list());
        let resolver = DockerAddressResolver::new(client, "bridge");
        assert!(matches!(
            resolver.running().await,
            Err(SnatGuardError::DockerApi(_))
        ));
    }

    #[tokio::test]
    async fn ping_reflects_docker_reachability() {
        let ok = DockerAddressResolver::new(Arc::new(MockDockerClient::new()), "bridge");
        assert!(ok.ping().await.is_ok());

        let down = DockerAddressResolver::new(
            Arc::new(MockDockerClient::new().with_failing_ping()),
            "bridge",
        );
        assert!(matches!(
            down.ping().await,
            Err(SnatGuardError::DockerConnection(_))
        ));
    }

    #[tokio::test]
    async fn missing_bridge_is_resolution_error() {
        let client = Arc::new(MockDockerClient::new().with_container("mc1", "10.0.0.5", "172.17.0.2"));
        let resolver = DockerAddressResolver::new(client, "mc-net");
        assert!(matches!(
            resolver.resolve("mc1").await,
            Err(SnatGuardError::AddressResolution { .. })
        ));
    }

    #[test]
    fn skips_wildcard_and_ipv6_bindings() {
        let n = networks(
            &[("25565/tcp", vec!["0.0.0.0", "::", "192.168.1.10"])],
            &[("bridge", "172.17.0.2")],
        );
        let pair = address_pair("mc1", &n, "bridge").unwrap();
        assert_eq!(pair.external, Ipv4Addr::new(192, 168, 1, 10));
    }

    #[test]
    fn picks_first_port_in_key_order() {
        let n = networks(
            &[("8080/tcp", vec!["10.0.0.8"]), ("25565/tcp", vec!["10.0.0.5"])],
            &[("bridge", "172.17.0.2")],
        );
        let pair = address_pair("mc1", &n, "bridge").unwrap();
        assert_eq!(pair.external, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn no_published_port_is_resolution_error() {
        let n = networks(&[("25565/tcp", vec![])], &[("bridge", "172.17.0.2")]);
        let err = address_pair("mc1", &n, "bridge").unwrap_err();
        assert!(err.to_string().contains("mc1"));
    }

    #[test]
    fn empty_bridge_address_is_resolution_error() {
        let n = networks(&[("25565/tcp", vec!["10.0.0.5"])], &[("bridge", "")]);
        assert!(matches!(
            address_pair("mc1", &n, "bridge"),
            Err(SnatGuardError::AddressResolution { .. })
        ));
    }

    #[test]
    fn unparsable_bridge_address_is_resolution_error() {
        let n = networks(&[("25565/tcp", vec!["10.0.0.5"])], &[("bridge", "fe80::1")]);
        assert!(address_pair("mc1", &n, "bridge").is_err());
    }
}
