//! Layered process configuration.
//!
//! Configuration is assembled from an optional YAML file plus prefixed
//! environment variables, with later sources overriding earlier ones. The
//! merged result can be queried key-by-key or deserialized wholesale into a
//! typed settings struct.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Data, Env, Serialized, Yaml},
    value::{Dict, Map},
    Figment, Metadata, Profile, Provider,
};
use serde::Deserialize;
use snafu::Snafu;
use tracing::debug;
use weir_error::GenericError;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// How the missing field can be provided, including the environment
        /// variable form when environment loading is active.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field held a value of the wrong type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the offending field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e.into() },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LookupSource {
    Environment { prefix: String },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> String {
        // The stored prefix is already uppercased with its trailing underscore.
        match self {
            LookupSource::Environment { prefix } => {
                format!("{}{}", prefix, key.replace('.', "_").to_uppercase())
            }
        }
    }
}

// A provider with its file data read and parsed eagerly, so that loading
// errors surface at load time rather than on first query.
struct FileProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl FileProvider {
    fn from_yaml<P>(path: P) -> Result<Self, figment::Error>
    where
        P: AsRef<Path>,
    {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| e.to_string())?;
        let data = Data::<Yaml>::string(&raw).data()?;

        Ok(Self {
            data,
            metadata: Metadata::from("YAML file", path.as_ref()),
        })
    }
}

impl Provider for FileProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Ok(self.data.clone())
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from multiple sources.
///
/// Sources added later take precedence over sources added earlier. Once all
/// sources are attached, the loader is consumed into either a typed settings
/// value ([`into_typed`][Self::into_typed]) or a queryable
/// [`GenericConfiguration`] ([`into_generic`][Self::into_generic]).
#[derive(Default)]
pub struct ConfigurationLoader {
    lookup_sources: HashSet<LookupSource>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid YAML, an error is returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let provider = FileProvider::from_yaml(&path)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable, and not being
    /// valid YAML.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        match FileProvider::from_yaml(&path) {
            Ok(provider) => {
                self.providers.push(BoxedProvider(Box::new(provider)));
            }
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read YAML configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// An underscore is appended to the prefix if not already present, so a
    /// prefix of `WEIR` matches any variable starting with `WEIR_`. Matching is
    /// case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error is returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_string()
        } else {
            format!("{}_", prefix)
        };

        // `Env` is not Send + Sync, so its resolved values are captured into a
        // serialized provider instead of holding the provider itself.
        let values = Env::prefixed(&prefix).data()?;
        if let Some(dict) = values.get(&Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(dict.clone()))));
            self.lookup_sources.insert(LookupSource::Environment { prefix });
        }
        Ok(self)
    }

    /// Consumes the loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error is returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.build_figment().extract().map_err(Into::into)
    }

    /// Consumes the loader, wrapping the merged configuration for key-based queries.
    pub fn into_generic(self) -> GenericConfiguration {
        let figment = self.build_figment();
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment,
                lookup_sources: self.lookup_sources,
            }),
        }
    }

    fn build_figment(&self) -> Figment {
        self.providers
            .iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider))
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    lookup_sources: HashSet<LookupSource>,
}

/// The merged configuration, queryable by key.
///
/// Keys are period-separated paths: with a YAML document `{a: {b: 5}}`,
/// querying `a.b` yields `5` and querying `a` yields the nested mapping.
/// Cheaply cloneable.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(e.kind, Kind::MissingField(_)) {
                    // A nested key such as `source.kind` may only be present in
                    // flattened environment-variable form, so retry with the
                    // separators collapsed to underscores.
                    let fallback_key = key.replace('.', "_");
                    self.inner
                        .figment
                        .extract_inner(&fallback_key)
                        .map_err(|fallback_e| from_figment_error(&self.inner.lookup_sources, fallback_e))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist, or the value could not be deserialized into
    /// `T`, an error is returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, falling back to `T::default()`.
    ///
    /// The default is used both when the key is absent and when
    /// deserialization fails, so this swallows errors and should be used
    /// sparingly.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the key exists but its value could not be deserialized into `T`, an
    /// error is returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to deserialize the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error is returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.lookup_sources, e))
    }
}

fn from_figment_error(lookup_sources: &HashSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = lookup_sources
                .iter()
                .map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use serde::Deserialize;

    use super::*;

    #[derive(Deserialize)]
    struct Settings {
        worker_count: usize,
        log_level: String,
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn yaml_values_round_trip() {
        let file = write_config("worker_count: 4\nlog_level: debug\n");

        let config = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_generic();

        assert_eq!(config.get_typed::<usize>("worker_count").unwrap(), 4);

        let settings: Settings = config.as_typed().unwrap();
        assert_eq!(settings.worker_count, 4);
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn missing_field_reports_env_candidates() {
        let file = write_config("worker_count: 4\n");

        let config = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .from_environment("WEIR_CONFIG_TEST")
            .unwrap()
            .into_generic();

        assert!(config.try_get_typed::<String>("log_level").unwrap().is_none());
        assert_eq!(config.get_typed_or_default::<u64>("queue_capacity"), 0);

        match config.get_typed::<String>("log_level") {
            Err(ConfigurationError::MissingField { field, .. }) => assert_eq!(field, "log_level"),
            other => panic!("expected missing field error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn later_sources_override_earlier_ones() {
        let base = write_config("worker_count: 4\nlog_level: info\n");
        let overlay = write_config("log_level: trace\n");

        let config = ConfigurationLoader::default()
            .from_yaml(base.path())
            .unwrap()
            .from_yaml(overlay.path())
            .unwrap()
            .into_generic();

        assert_eq!(config.get_typed::<String>("log_level").unwrap(), "trace");
        assert_eq!(config.get_typed::<usize>("worker_count").unwrap(), 4);
    }

    #[test]
    fn invalid_yaml_is_a_load_error() {
        let file = write_config(":\n  - not yaml");
        assert!(ConfigurationLoader::default().from_yaml(file.path()).is_err());
    }
}
