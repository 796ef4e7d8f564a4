//! CLI argument definitions for dfmd.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

use dfm_core::config::DfmConfig;

/// Container SNAT rule manager.
///
/// Watches Docker container start/die events and keeps one tagged SNAT rule
/// per managed container in the host NAT table.
#[derive(Parser, Debug)]
#[command(name = "dfmd")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Bridge network whose address is used as the rule source.
    ///
    /// Takes precedence over `docker.bridge` in the config file.
    pub bridge: Option<String>,

    /// Path to dfm.toml configuration file.
    #[arg(short, long, default_value = "/etc/dfm/dfm.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Override PID file path (takes precedence over config file).
    #[arg(long)]
    pub pid_file: Option<String>,

    /// Override the minimum interval between prunes, in milliseconds.
    #[arg(long)]
    pub prune_interval_ms: Option<u64>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,
}

impl DaemonCli {
    /// Applies command-line overrides on top of file and environment values.
    pub fn apply_overrides(&self, config: &mut DfmConfig) {
        if let Some(bridge) = &self.bridge {
            config.docker.bridge = bridge.clone();
        }
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.general.log_format = format.clone();
        }
        if let Some(pid_file) = &self.pid_file {
            config.general.pid_file = pid_file.clone();
        }
        if let Some(ms) = self.prune_interval_ms {
            config.reconcile.prune_interval_ms = ms;
        }
    }
}
