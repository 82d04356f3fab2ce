//! Telemetry aggregation agent.
//!
//! Consumes raw telemetry events from a broker source, classifies them
//! through namespace filter programs, aggregates the results into rolling
//! bucketed windows, and exposes the flushed values for Prometheus scrapes.

#![deny(warnings)]
#![deny(missing_docs)]

use std::sync::Arc;

use chrono::Utc;
use clap::Parser as _;
use tracing::{error, info};
use tracing_subscriber::{
    layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter,
};
use weir_config::ConfigurationLoader;
use weir_core::broker::BrokerConsumer;
use weir_core::catalog::Catalog;
use weir_core::pipeline::{ComponentShutdownCoordinator, Pipeline};
use weir_core::registry::Registry;
use weir_core::router::{classification_functions, FilterRoot};
use weir_core::sink::MetricSink;
use weir_core::store::SharedClock;
use weir_core::telemetry::PipelineTelemetry;
use weir_error::{ErrorContext as _, GenericError};
use weir_expr::Interpreter;
use weir_io::api::{ApiServer, Readiness};
use weir_io::consumers::{QueueConsumer, QueueProducer, SocketConsumer};
use weir_io::prometheus::PrometheusSink;
use weir_io::state::FileStateStore;

mod config;
use self::config::{AgentConfiguration, Cli, LogFormat, SourceKind};

/// Logs a message to standard error and exits with a non-zero exit code.
fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = match load_configuration(&cli) {
        Ok(configuration) => configuration,
        Err(e) => {
            fatal_and_exit(format!("failed to load configuration: {}", e));
            return;
        }
    };

    if let Err(e) = initialize_logging(&configuration, cli.log_level.as_deref()) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(configuration).await {
        Ok(()) => info!("Weir agent stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn load_configuration(cli: &Cli) -> Result<AgentConfiguration, GenericError> {
    let configuration = ConfigurationLoader::default()
        .try_from_yaml(&cli.config)
        .from_environment("WEIR")?
        .into_typed()?;
    Ok(configuration)
}

fn initialize_logging(
    config: &AgentConfiguration, override_directive: Option<&str>,
) -> Result<(), GenericError> {
    let directive = override_directive.unwrap_or_else(|| config.log_level());
    let filter = EnvFilter::try_new(directive)
        .with_error_context(|| format!("invalid log filter directive '{}'", directive))?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format() {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .error_context("Failed to install the tracing subscriber.")
}

async fn run(config: AgentConfiguration) -> Result<(), GenericError> {
    let settings = config.aggregation().resolve()?;

    let catalog = Arc::new(Catalog::load_dir(config.namespace_dir())?);
    let group_source = std::fs::read_to_string(config.group_filter_path()).with_error_context(
        || {
            format!(
                "failed to read group program {}",
                config.group_filter_path().display()
            )
        },
    )?;
    let engine = Interpreter::new(classification_functions());
    let filter_root = FilterRoot::build(Arc::clone(&catalog), &engine, &group_source)?;
    info!(
        namespaces = catalog.len(),
        groups = filter_root.group_count(),
        "Loaded namespace catalog."
    );

    let sink = Arc::new(PrometheusSink::new());
    let telemetry = PipelineTelemetry::register(
        Arc::clone(&sink) as Arc<dyn MetricSink>,
        config.pipeline().stage_timing(),
    )?;
    let clock = Arc::new(SharedClock::aligned(Utc::now(), settings.granularity));
    let registry = Arc::new(Registry::build(
        catalog,
        filter_root,
        Arc::clone(&sink) as Arc<dyn MetricSink>,
        telemetry,
        settings,
        clock,
    )?);

    let state_store = match config.state_dir() {
        Some(dir) => Some(FileStateStore::new(dir)?),
        None => None,
    };
    if let Some(store) = &state_store {
        let restored = registry.restore_state(store)?;
        if restored > 0 {
            info!(windows = restored, "Restored persisted window state.");
        }
    }

    let mut coordinator = ComponentShutdownCoordinator::default();

    let readiness = Readiness::new();
    let api = ApiServer::bind(
        config.api_listen_addr(),
        Arc::clone(&sink),
        readiness.clone(),
    )
    .await?;
    let listen_addr = api.local_addr()?;
    info!(%listen_addr, "Serving scrape and readiness endpoints.");
    let api_task = api.listen(coordinator.register());

    let (consumer, _queue_producer) = build_consumer(&config).await?;
    let pipeline = Pipeline::spawn(
        Arc::clone(&registry),
        consumer,
        config.pipeline(),
        &mut coordinator,
    )?;

    readiness.mark_ready();
    info!("Weir agent running, waiting for interrupt...");

    tokio::signal::ctrl_c()
        .await
        .error_context("Failed to listen for the shutdown signal.")?;
    info!("Shutdown signal received. Exiting...");

    coordinator.shutdown();
    pipeline.join().await;
    api_task
        .await
        .error_context("API server task failed to stop cleanly.")?;

    if let Some(store) = &state_store {
        let saved = registry.save_state(store)?;
        info!(metrics = saved, "Persisted window state.");
    }

    Ok(())
}

/// Builds the configured broker consumer.
///
/// The queue producer half, when present, is held by the caller so an
/// embedded queue source stays open until shutdown.
async fn build_consumer(
    config: &AgentConfiguration,
) -> Result<(Arc<dyn BrokerConsumer>, Option<QueueProducer>), GenericError> {
    let queue_capacity = config.pipeline().queue_capacity()?;

    match config.source().kind() {
        SourceKind::Socket => {
            let consumer = SocketConsumer::bind(
                config.source().listen_addr(),
                config.subscription(),
                queue_capacity,
                config.source().max_in_flight()?,
            )
            .await?;
            Ok((Arc::new(consumer) as Arc<dyn BrokerConsumer>, None))
        }
        SourceKind::Queue => {
            let (producer, consumer) = QueueConsumer::pair(config.subscription(), queue_capacity);
            Ok((Arc::new(consumer) as Arc<dyn BrokerConsumer>, Some(producer)))
        }
    }
}
