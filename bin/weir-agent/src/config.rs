//! Agent command line and configuration surface.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use weir_core::broker::SubscriptionSpec;
use weir_core::config::{AggregationConfiguration, PipelineConfiguration};
use weir_error::{generic_error, GenericError};

/// Aggregates telemetry events into windowed Prometheus metrics.
#[derive(Debug, Parser)]
#[command(name = "weir-agent")]
pub struct Cli {
    /// Path to the agent configuration file.
    #[arg(short, long, default_value = "./weir.yaml")]
    pub config: PathBuf,

    /// Log filter override, e.g. `debug` or `weir_core=trace`.
    #[arg(long)]
    pub log_level: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_namespace_dir() -> PathBuf {
    PathBuf::from("./conf/namespaces")
}

fn default_group_filter_path() -> PathBuf {
    PathBuf::from("./conf/groups.flt")
}

fn default_api_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7700))
}

fn default_source_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6650))
}

fn default_max_in_flight() -> usize {
    128
}

fn default_subscription() -> SubscriptionSpec {
    SubscriptionSpec {
        topics: vec!["weir/events".to_string()],
        subscription_name: "weir-aggregator".to_string(),
        consumer_name: "weir".to_string(),
        delivery_mode: Default::default(),
        initial_position: Default::default(),
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console output.
    #[default]
    Pretty,

    /// One JSON object per line.
    Json,
}

/// Which broker consumer feeds the pipeline.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// TCP listener taking newline-delimited payloads.
    #[default]
    Socket,

    /// In-memory queue, for embedded and smoke-test setups.
    Queue,
}

/// Broker source configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceConfiguration {
    /// Consumer implementation to run.
    #[serde(default)]
    kind: SourceKind,

    /// Listen address for the socket source.
    #[serde(default = "default_source_listen_addr")]
    listen_addr: SocketAddr,

    /// Unacknowledged messages allowed per connection before the socket
    /// source stops reading from it.
    #[serde(default = "default_max_in_flight")]
    max_in_flight: usize,
}

impl Default for SourceConfiguration {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            listen_addr: default_source_listen_addr(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl SourceConfiguration {
    /// Consumer implementation to run.
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Listen address for the socket source.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Per-connection in-flight limit for the socket source.
    pub fn max_in_flight(&self) -> Result<usize, GenericError> {
        if self.max_in_flight == 0 {
            return Err(generic_error!("source.max_in_flight must be at least 1"));
        }
        Ok(self.max_in_flight)
    }
}

/// The agent's full configuration, merged from YAML and `WEIR_` environment
/// variables.
#[derive(Debug, Deserialize)]
pub struct AgentConfiguration {
    /// Log filter directive.
    #[serde(default = "default_log_level")]
    log_level: String,

    /// Log output format.
    #[serde(default)]
    log_format: LogFormat,

    /// Directory of namespace definition files.
    #[serde(default = "default_namespace_dir")]
    namespace_dir: PathBuf,

    /// Path of the shared group classification program.
    #[serde(default = "default_group_filter_path")]
    group_filter_path: PathBuf,

    /// Listen address for the /metrics and /ready server.
    #[serde(default = "default_api_listen_addr")]
    api_listen_addr: SocketAddr,

    /// Directory for persisted window state. Unset disables persistence.
    #[serde(default)]
    state_dir: Option<PathBuf>,

    /// Window geometry and folding settings.
    #[serde(flatten)]
    aggregation: AggregationConfiguration,

    /// Worker pool and queue settings.
    #[serde(flatten)]
    pipeline: PipelineConfiguration,

    /// Broker source settings.
    #[serde(default)]
    source: SourceConfiguration,

    /// Broker subscription parameters.
    #[serde(default = "default_subscription")]
    subscription: SubscriptionSpec,
}

impl AgentConfiguration {
    /// Log filter directive.
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Log output format.
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Directory of namespace definition files.
    pub fn namespace_dir(&self) -> &Path {
        &self.namespace_dir
    }

    /// Path of the shared group classification program.
    pub fn group_filter_path(&self) -> &Path {
        &self.group_filter_path
    }

    /// Listen address for the API server.
    pub fn api_listen_addr(&self) -> SocketAddr {
        self.api_listen_addr
    }

    /// Directory for persisted window state, if enabled.
    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    /// Window geometry and folding settings.
    pub fn aggregation(&self) -> &AggregationConfiguration {
        &self.aggregation
    }

    /// Worker pool and queue settings.
    pub fn pipeline(&self) -> &PipelineConfiguration {
        &self.pipeline
    }

    /// Broker source settings.
    pub fn source(&self) -> &SourceConfiguration {
        &self.source
    }

    /// Broker subscription parameters.
    pub fn subscription(&self) -> &SubscriptionSpec {
        &self.subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AgentConfiguration = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config.log_level(), "info");
        assert_eq!(config.log_format(), LogFormat::Pretty);
        assert_eq!(config.namespace_dir(), Path::new("./conf/namespaces"));
        assert_eq!(config.api_listen_addr(), "0.0.0.0:7700".parse().unwrap());
        assert_eq!(config.source().kind(), SourceKind::Socket);
        assert_eq!(config.source().max_in_flight().unwrap(), 128);
        assert!(config.state_dir().is_none());
        assert_eq!(config.subscription().topics, vec!["weir/events".to_string()]);
        assert!(config.aggregation().resolve().is_ok());
    }

    #[test]
    fn flattened_aggregation_keys_are_read() {
        let config: AgentConfiguration =
            serde_yaml::from_str("granularity_secs: 5\ncardinality: 4\nworker_count: 2").unwrap();

        let settings = config.aggregation().resolve().unwrap();
        assert_eq!(settings.cardinality, 4);
        assert_eq!(config.pipeline().worker_count().unwrap(), 2);
    }

    #[test]
    fn source_section_selects_the_queue_consumer() {
        let config: AgentConfiguration =
            serde_yaml::from_str("source:\n  kind: queue\n  max_in_flight: 0").unwrap();

        assert_eq!(config.source().kind(), SourceKind::Queue);
        assert!(config.source().max_in_flight().is_err());
    }

    #[test]
    fn json_log_format_is_recognized() {
        let config: AgentConfiguration = serde_yaml::from_str("log_format: json").unwrap();
        assert_eq!(config.log_format(), LogFormat::Json);
    }
}
