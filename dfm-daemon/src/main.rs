use anyhow::Result;
use clap::Parser;

use dfm_core::config::DfmConfig;
use dfm_daemon::cli::DaemonCli;
use dfm_daemon::logging;
use dfm_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    // 설정 로드: 파일 → 환경변수 → CLI 순서로 덮어씀
    let mut config = DfmConfig::load_or_default(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", cli.config.display(), e))?;
    cli.apply_overrides(&mut config);

    if cli.validate {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;
        println!("configuration OK: {}", cli.config.display());
        return Ok(());
    }

    logging::init_tracing(&config.general)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "dfmd starting"
    );

    let mut orchestrator = Orchestrator::build_from_config(config).await?;
    orchestrator.run().await
}
