use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use registry::request::normalize_query;
use registry::{RateLimiter, Registry, RegistryClient, RegistryError};
use shared::metrics_defs::describe_all;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;

#[derive(Parser)]
#[command(name = "regbridge", about = "Batch lookups against the patent register")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the job API and the admin listener.
    Serve {
        #[arg(long)]
        config: PathBuf,
    },
    /// Look up a single publication number and print the record as JSON.
    Lookup {
        #[arg(long)]
        config: PathBuf,
        identifier: String,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Batch(#[from] batch::BatchError),
    #[error("could not encode record: {0}")]
    Json(#[from] serde_json::Error),
}

fn init_logging(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some("regbridge"))
        .map_err(|e| CliError::Telemetry(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Telemetry(e.to_string()))?;

    describe_all(registry::metrics_defs::ALL_METRICS);
    describe_all(batch::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}

fn init_telemetry(common: &CommonConfig) -> Result<Option<sentry::ClientInitGuard>, CliError> {
    let guard = init_logging(&common.logging);
    if let Some(metrics) = &common.metrics {
        init_metrics(metrics)?;
    }
    Ok(guard)
}

async fn serve(config: Config) -> Result<(), CliError> {
    let client = RegistryClient::from_config(&config.registry)?;
    let limiter = Arc::new(RateLimiter::new(&config.registry.rate_limit));

    tracing::info!(
        api_url = %config.registry.registry.api_url,
        max_concurrent = config.registry.rate_limit.max_concurrent,
        min_spacing_ms = config.registry.rate_limit.min_spacing_ms,
        "starting regbridge"
    );
    batch::run(config.server, Arc::new(client), limiter).await?;
    Ok(())
}

async fn lookup(config: Config, identifier: &str) -> Result<(), CliError> {
    let identifier = normalize_query(identifier);
    if !batch::jobs::is_valid_identifier(&identifier) {
        return Err(RegistryError::Format(identifier).into());
    }

    let client = RegistryClient::from_config(&config.registry)?;
    let record = client.lookup(&identifier).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn run(cli: Cli) -> Result<(), CliError> {
    let (config_path, identifier) = match cli.command {
        CliCommand::Serve { config } => (config, None),
        CliCommand::Lookup { config, identifier } => (config, Some(identifier)),
    };

    let config = Config::from_file(&config_path)?;
    let _sentry = init_telemetry(&config.common)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match identifier {
        None => rt.block_on(serve(config)),
        Some(identifier) => rt.block_on(lookup(config, &identifier)),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_lookup() {
        let cli = Cli::parse_from(["regbridge", "lookup", "--config", "bridge.yaml", "EP1234567"]);
        match cli.command {
            CliCommand::Lookup { config, identifier } => {
                assert_eq!(config, PathBuf::from("bridge.yaml"));
                assert_eq!(identifier, "EP1234567");
            }
            CliCommand::Serve { .. } => panic!("expected lookup"),
        }
    }

    #[test]
    fn parse_serve_requires_config() {
        assert!(Cli::try_parse_from(["regbridge", "serve"]).is_err());
    }
}
