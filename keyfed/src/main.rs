use clap::{Parser, Subcommand};
use config::{Config, LoggingConfig, MetricsConfig};
use federation::FederationError;
use federation::config::FederationConfig;
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

/// Exchanges exposure keys with the federation gateway. Each invocation runs
/// one direction and prints a JSON summary on stdout.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[arg(long, short, default_value = "keyfed.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Clone, Copy)]
enum CliCommand {
    /// Store keys published by partner backends
    Download,
    /// Send locally submitted keys to the gateway
    Upload,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Federation(#[from] FederationError),
    #[error("could not encode summary: {0}")]
    Summary(#[from] serde_json::Error),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("could not install metrics recorder: {0}")]
    Metrics(String),
}

fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics_config: Option<&MetricsConfig>) -> Result<(), CliError> {
    let Some(metrics_config) = metrics_config else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(&metrics_config.statsd_host, metrics_config.statsd_port)
        .build(Some(metrics_config.prefix.as_str()))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
    shared::metrics_defs::describe_all(federation::metrics_defs::ALL_METRICS);

    Ok(())
}

async fn run(command: CliCommand, config: &FederationConfig) -> Result<String, CliError> {
    let summary = match command {
        CliCommand::Download => serde_json::to_string(&federation::run_download(config).await?)?,
        CliCommand::Upload => serde_json::to_string(&federation::run_upload(config).await?)?,
    };
    Ok(summary)
}

fn execute(command: CliCommand, config: &Config) -> Result<String, CliError> {
    init_metrics(config.common.metrics.as_ref())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(command, &config.federation))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    let _sentry = init_logging(config.common.logging.as_ref());

    match execute(cli.command, &config) {
        Ok(summary) => {
            println!("{summary}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "invocation failed");
            ExitCode::FAILURE
        }
    }
}
