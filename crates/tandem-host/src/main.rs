use std::path::PathBuf;

use anyhow::Context;
use tandem_host::config::{DEFAULT_CONFIG_PATH, HostConfig};
use tandem_host::launcher::ProcessLauncher;
use tandem_host::orchestrator::ServerOrchestrator;
use tandem_host::reaper::{NoopReaper, PlatformReaper, ProcessReaper};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing(config: &HostConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tandem=info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "tandem-host.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("wait for ctrl-c")?,
            _ = term.recv() => tracing::info!("received SIGTERM"),
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")
    }
}

async fn run<R: ProcessReaper>(config: HostConfig, reaper: R) -> anyhow::Result<()> {
    let launcher = ProcessLauncher::new(config.log_max_lines);
    let mut orchestrator =
        ServerOrchestrator::new(config, launcher, reaper).context("build orchestrator")?;

    let ports = orchestrator.start().await.context("start services")?;
    tracing::info!(
        backend = %format!("http://127.0.0.1:{}", ports.backend_port),
        frontend = %format!("http://127.0.0.1:{}", ports.frontend_port),
        "tandem-host ready"
    );

    let waited = shutdown_signal().await;
    tracing::info!("shutting down");
    orchestrator.stop().await;
    waited
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::var("TANDEM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = HostConfig::load(&path).context("load config")?;
    config.apply_env_overrides();

    let _guard = init_tracing(&config)?;
    tracing::info!(config = %path.display(), mode = config.mode.as_str(), "tandem-host starting");

    if config.reclaim_stale {
        run(config, PlatformReaper::default()).await
    } else {
        run(config, NoopReaper).await
    }
}
