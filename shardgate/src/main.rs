use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::{MetricDef, MetricType};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;

#[derive(Parser)]
#[command(name = "shardgate", about = "Sharding reverse proxy for real-time event queues")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the proxy, taking over from a running instance if there is one
    Run {
        #[arg(long, short, default_value = "/etc/shardgate/config.yaml")]
        config: PathBuf,
    },
    /// Load and validate a config file, then exit
    CheckConfig {
        #[arg(long, short)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::CheckConfig { config } => match Config::from_file(&config) {
            Ok(_) => {
                println!("{}: ok", config.display());
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{}: {err}", config.display());
                ExitCode::FAILURE
            }
        },
        CliCommand::Run { config } => {
            let config = match Config::from_file(&config) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("{}: {err}", config.display());
                    return ExitCode::FAILURE;
                }
            };
            run(config)
        }
    }
}

fn run(config: Config) -> ExitCode {
    let Config { common, proxy } = config;
    // Held until exit so buffered events are flushed.
    let _sentry = init_logging(&common.logging);
    init_metrics(&common);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "Could not start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(proxy::run(proxy)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Proxy failed to start");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(common: &CommonConfig) {
    let Some(MetricsConfig {
        statsd_host,
        statsd_port,
        prefix,
    }) = &common.metrics
    else {
        tracing::info!("No metrics backend configured");
        return;
    };

    let recorder = match StatsdBuilder::from(statsd_host.as_str(), *statsd_port).build(Some(prefix.as_str()))
    {
        Ok(recorder) => recorder,
        Err(err) => {
            tracing::error!(error = %err, "Could not build statsd recorder, metrics disabled");
            return;
        }
    };
    if let Err(err) = metrics::set_global_recorder(recorder) {
        tracing::error!(error = %err, "Metrics recorder already installed");
        return;
    }

    for def in [
        proxy::metrics_defs::ALL_METRICS,
        directory::metrics_defs::ALL_METRICS,
    ]
    .concat()
    {
        describe(&def);
    }
    tracing::info!(host = %statsd_host, port = statsd_port, "Sending metrics to statsd");
}

fn describe(def: &MetricDef) {
    match def.metric_type {
        MetricType::Counter => metrics::describe_counter!(def.name, def.description),
        MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
        MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
    }
}
