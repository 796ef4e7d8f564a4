//! Logging initialization for dfmd.
//!
//! Configures `tracing-subscriber` from the `[general]` section of
//! `DfmConfig`: JSON lines for log collectors, or pretty output for a
//! terminal.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dfm_core::config::GeneralConfig;

/// Docker client internals are only interesting when explicitly asked for.
const QUIET_DEPENDENCIES: &str = "bollard=warn,hyper=warn,hyper_util=warn";

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(anyhow::anyhow!(
                "unknown log format '{}', expected 'json' or 'pretty'",
                other
            )),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Pretty => f.write_str("pretty"),
        }
    }
}

/// Filter directives for `level`. `RUST_LOG`, when set, replaces them.
pub fn filter_directives(level: &str) -> String {
    format!("{level},{QUIET_DEPENDENCIES}")
}

/// Initialize the global tracing subscriber.
///
/// Must be called exactly once, before any tracing macros are used.
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let format: LogFormat = config.log_format.parse()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    };

    installed.map_err(|e| anyhow::anyhow!("failed to initialize {} tracing subscriber: {}", format, e))
}
