use apiproxy::config::{Settings, SettingsError};
use clap::Parser;
use metrics_exporter_statsd::StatsdBuilder;
use std::future::Future;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Load-balancing reverse proxy for a sharded financial Web API.
#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the APIPROXY_CONFIG_FILE environment variable.
    #[arg(long)]
    config_file_path: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Invalid environment: {0}")]
    Settings(#[from] SettingsError),
    #[error("Failed to create runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    let mut settings = Settings::from_env()?;
    if let Some(path) = cli.config_file_path {
        settings.config_file = path;
    }
    init_statsd_recorder("apiproxy", settings.statsd.clone());

    run_async(apiproxy::run(settings))
}

fn run_async(
    fut: impl Future<Output = Result<(), impl std::error::Error>>,
) -> Result<(), CliError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    if let Err(e) = rt.block_on(fut) {
        tracing::error!(error = %e, "Runtime error");
        process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn init_statsd_recorder(prefix: &str, statsd: Option<(String, u16)>) {
    if let Some((host, port)) = statsd {
        let recorder = StatsdBuilder::from(host, port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}
