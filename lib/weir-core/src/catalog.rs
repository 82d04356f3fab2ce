//! Namespace catalog loading and validation.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::warn;

use crate::data_model::{MetricKind, MetricSpec};
use weir_error::{generic_error, ErrorContext as _, GenericError};

/// Histogram buckets applied when a namespace declares none.
pub const DEFAULT_HISTOGRAM_BUCKETS: [f64; 11] =
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(Debug, Deserialize)]
struct NamespaceFile {
    namespace: String,
    group: String,
    service: String,
    filter: String,
    #[serde(default)]
    metrics: IndexMap<String, MetricEntry>,
}

#[derive(Debug, Deserialize)]
struct MetricEntry {
    #[serde(default)]
    help: String,
    #[serde(rename = "type")]
    kind: MetricKind,
    #[serde(default)]
    buckets: Option<Vec<f64>>,
}

/// A namespace definition resolved from the catalog directory.
#[derive(Clone, Debug)]
pub struct Namespace {
    /// Namespace name, unique process-wide.
    pub name: String,

    /// Classification group the namespace belongs to.
    pub group: String,

    /// Service name stamped on every series the namespace produces.
    pub service: String,

    /// Path of the namespace's classification program.
    pub filter: PathBuf,

    /// Metrics the namespace may emit.
    pub metrics: IndexMap<String, MetricSpec>,
}

/// All namespace definitions, loaded once at startup.
///
/// The catalog is immutable after loading; classification and aggregation
/// read from it without locks.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    namespaces: IndexMap<String, Namespace>,
}

impl Catalog {
    /// Loads every `*.yaml`/`*.yml` file in `dir` as a namespace definition.
    ///
    /// Files are loaded in lexicographic order so that catalog iteration, and
    /// with it registration order, is deterministic across runs.
    pub fn load_dir(dir: &Path) -> Result<Self, GenericError> {
        let entries = std::fs::read_dir(dir)
            .with_error_context(|| format!("Failed to read catalog directory '{}'.", dir.display()))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry
                .with_error_context(|| format!("Failed to read catalog directory '{}'.", dir.display()))?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        let mut namespaces = IndexMap::new();
        for path in paths {
            let namespace = load_namespace_file(&path)?;
            if namespaces.contains_key(&namespace.name) {
                return Err(generic_error!(
                    "duplicate namespace '{}' declared in '{}'",
                    namespace.name,
                    path.display()
                ));
            }
            namespaces.insert(namespace.name.clone(), namespace);
        }

        Ok(Self { namespaces })
    }

    /// Number of namespaces in the catalog.
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    /// Whether the catalog holds no namespaces.
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Looks up a namespace by name.
    pub fn get(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    /// Iterates namespaces in load order.
    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values()
    }

    /// Resolves the process-wide metric table.
    ///
    /// A metric name may appear in several namespaces, but every declaration
    /// must agree on kind and buckets, since all of them feed the same
    /// exported series.
    pub fn unified_metrics(&self) -> Result<IndexMap<String, MetricSpec>, GenericError> {
        let mut metrics: IndexMap<String, (MetricSpec, String)> = IndexMap::new();

        for namespace in self.namespaces.values() {
            for spec in namespace.metrics.values() {
                match metrics.get(&spec.name) {
                    None => {
                        metrics.insert(spec.name.clone(), (spec.clone(), namespace.name.clone()));
                    }
                    Some((existing, declared_in)) => {
                        if existing.kind != spec.kind || existing.buckets != spec.buckets {
                            return Err(generic_error!(
                                "metric '{}' declared as {} in namespace '{}' but {} in namespace '{}'",
                                spec.name,
                                existing.kind,
                                declared_in,
                                spec.kind,
                                namespace.name
                            ));
                        }
                    }
                }
            }
        }

        Ok(metrics.into_iter().map(|(name, (spec, _))| (name, spec)).collect())
    }

    /// Reads the classification program source of every namespace.
    pub fn read_filter_sources(&self) -> Result<IndexMap<String, String>, GenericError> {
        let mut sources = IndexMap::new();
        for namespace in self.namespaces.values() {
            let source = std::fs::read_to_string(&namespace.filter).with_error_context(|| {
                format!(
                    "Failed to read filter program '{}' for namespace '{}'.",
                    namespace.filter.display(),
                    namespace.name
                )
            })?;
            sources.insert(namespace.name.clone(), source);
        }
        Ok(sources)
    }
}

fn load_namespace_file(path: &Path) -> Result<Namespace, GenericError> {
    let raw = std::fs::read_to_string(path)
        .with_error_context(|| format!("Failed to read namespace file '{}'.", path.display()))?;
    let file: NamespaceFile = serde_yaml::from_str(&raw)
        .with_error_context(|| format!("Failed to parse namespace file '{}'.", path.display()))?;

    for (field, value) in [
        ("namespace", &file.namespace),
        ("group", &file.group),
        ("service", &file.service),
        ("filter", &file.filter),
    ] {
        if value.trim().is_empty() {
            return Err(generic_error!(
                "field '{}' must be non-empty in '{}'",
                field,
                path.display()
            ));
        }
    }

    if file.metrics.is_empty() {
        warn!(namespace = %file.namespace, "Namespace declares no metrics.");
    }

    let mut metrics = IndexMap::new();
    for (name, entry) in file.metrics {
        if !valid_metric_name(&name) {
            return Err(generic_error!(
                "invalid metric name '{}' in namespace '{}'",
                name,
                file.namespace
            ));
        }

        let buckets = match (entry.kind, entry.buckets) {
            (MetricKind::Histogram, Some(buckets)) => {
                if buckets.is_empty() || !buckets.windows(2).all(|w| w[0] < w[1]) {
                    return Err(generic_error!(
                        "histogram '{}' in namespace '{}' needs strictly increasing buckets",
                        name,
                        file.namespace
                    ));
                }
                Some(buckets)
            }
            (MetricKind::Histogram, None) => Some(DEFAULT_HISTOGRAM_BUCKETS.to_vec()),
            (kind, Some(_)) => {
                return Err(generic_error!(
                    "metric '{}' in namespace '{}' is a {} and cannot declare buckets",
                    name,
                    file.namespace,
                    kind
                ));
            }
            (_, None) => None,
        };

        metrics.insert(
            name.clone(),
            MetricSpec {
                name,
                help: entry.help,
                kind: entry.kind,
                buckets,
            },
        );
    }

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(Namespace {
        name: file.namespace,
        group: file.group,
        service: file.service,
        filter: base.join(&file.filter),
        metrics,
    })
}

fn valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
