//! Daemon orchestration -- assembly and lifecycle management.
//!
//! The [`Orchestrator`] is the central coordinator of `dfmd`. It takes a
//! loaded configuration, connects to Docker, assembles the SNAT guard and
//! runs it until a shutdown signal arrives or the container event feed is
//! lost.
//!
//! # Startup
//!
//! 1. Validate configuration
//! 2. Install the metrics recorder (when enabled)
//! 3. Connect to Docker and ping it (fatal on failure)
//! 4. Write the PID file (when configured)
//! 5. Start the guard (initial sync, then event subscription)
//!
//! # Shutdown
//!
//! `SIGTERM`/`SIGINT` cancel the guard loop between events. A lost event
//! feed stops the daemon with an error so a supervisor can restart it.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast;

use dfm_core::config::DfmConfig;
use dfm_core::pipeline::{HealthStatus, Pipeline};
use dfm_snat_guard::{
    BollardDockerClient, DockerAddressResolver, DockerClient, DockerEventSource,
    IptablesRuleStore, SnatGuard, SnatGuardBuilder, SnatGuardConfig,
};

use crate::health::{DaemonHealth, log_health};
use crate::metrics_server;
use crate::pid_file::PidFile;

/// Guard wired to the real Docker daemon and iptables.
pub type DockerSnatGuard =
    SnatGuard<IptablesRuleStore, DockerAddressResolver<BollardDockerClient>, DockerEventSource>;

/// Interval between health polls in the main loop.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Why the main loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Signal(&'static str),
    FeedClosed,
}

/// The main daemon orchestrator.
pub struct Orchestrator {
    /// Validated configuration.
    config: DfmConfig,
    /// The SNAT guard pipeline.
    guard: DockerSnatGuard,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
}

impl Orchestrator {
    /// Load configuration from `config_path` and build the orchestrator.
    ///
    /// A missing file falls back to defaults.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = DfmConfig::load_or_default(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration.
    ///
    /// # Errors
    ///
    /// - Configuration validation fails
    /// - Metrics recorder cannot be installed
    /// - Docker daemon cannot be reached
    pub async fn build_from_config(config: DfmConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let guard_config = SnatGuardConfig::from_core(&config);
        guard_config
            .validate()
            .map_err(|e| anyhow::anyhow!("snat guard config invalid: {}", e))?;

        tracing::info!(socket = %guard_config.docker_socket, "connecting to docker");
        let client = BollardDockerClient::connect_with_socket(&guard_config.docker_socket)?;
        match tokio::time::timeout(guard_config.inspect_timeout(), client.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(anyhow::anyhow!("docker daemon not reachable: {}", e)),
            Err(_) => {
                return Err(anyhow::anyhow!(
                    "docker daemon not reachable: ping timed out after {}s",
                    guard_config.inspect_timeout_secs
                ));
            }
        }

        let store = IptablesRuleStore::new(&guard_config);
        let source =
            DockerEventSource::new(client.handle(), guard_config.event_channel_capacity);
        let resolver = DockerAddressResolver::new(Arc::new(client), guard_config.bridge.clone())
            .with_timeout(guard_config.inspect_timeout());

        let guard = SnatGuardBuilder::new()
            .config(guard_config)
            .store(store)
            .resolver(resolver)
            .event_source(source)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build snat guard: {}", e))?;

        if config.metrics.enabled {
            record_daemon_metrics();
        }

        tracing::info!(bridge = %config.docker.bridge, "orchestrator initialized");

        Ok(Self {
            config,
            guard,
            start_time: Instant::now(),
        })
    }

    /// Start the guard and block until shutdown.
    ///
    /// # Errors
    ///
    /// - PID file exists or cannot be written
    /// - Guard fails to start (event subscription)
    /// - Container event feed closes while running
    pub async fn run(&mut self) -> Result<()> {
        let _pid_file = (!self.config.general.pid_file.is_empty())
            .then(|| PidFile::create(&self.config.general.pid_file))
            .transpose()?;

        self.run_guard().await
    }

    async fn run_guard(&mut self) -> Result<()> {
        self.guard
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start snat guard: {}", e))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let uptime_updater = self
            .config
            .metrics
            .enabled
            .then(|| spawn_uptime_updater(self.start_time, shutdown_tx.subscribe()));

        let exit = self.wait_for_exit().await;

        let _ = shutdown_tx.send(());
        if let Some(task) = uptime_updater {
            let _ = task.await;
        }

        if let Err(e) = self.guard.stop().await {
            tracing::error!(error = %e, "failed to stop snat guard");
        }

        match exit? {
            Exit::Signal(signal) => {
                tracing::info!(signal, "dfmd shut down");
                Ok(())
            }
            Exit::FeedClosed => Err(anyhow::anyhow!(
                "container event feed closed, shutting down"
            )),
        }
    }

    async fn wait_for_exit(&mut self) -> Result<Exit> {
        let shutdown = wait_for_shutdown_signal();
        tokio::pin!(shutdown);

        let mut health_interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_status: Option<HealthStatus> = None;

        tracing::info!("entering main event loop");
        loop {
            tokio::select! {
                signal = &mut shutdown => {
                    let signal = signal?;
                    tracing::info!(signal, "shutdown signal received");
                    return Ok(Exit::Signal(signal));
                }
                () = self.guard.closed() => return Ok(Exit::FeedClosed),
                _ = health_interval.tick() => {}
            }

            let health = self.health().await;
            log_health(last_status.as_ref(), &health);
            last_status = Some(health.status);
        }
    }

    /// Current health snapshot.
    pub async fn health(&self) -> DaemonHealth {
        let status = self.guard.health_check().await;
        let uptime_secs = self.start_time.elapsed().as_secs();

        if self.config.metrics.enabled {
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(dfm_core::metrics::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
        }

        DaemonHealth {
            status,
            uptime_secs,
            guard_state: self.guard.state_name().to_owned(),
            events_processed: self.guard.events_processed(),
            operation_failures: self.guard.operation_failures(),
        }
    }

    pub fn config(&self) -> &DfmConfig {
        &self.config
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

fn record_daemon_metrics() {
    use dfm_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "daemon metrics recorded");
}

/// Refreshes the uptime gauge every 10 seconds until shutdown.
fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    use dfm_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let uptime_secs = start_time.elapsed().as_secs();
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}
