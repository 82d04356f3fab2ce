//! File-backed window state persistence.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use weir_core::persist::{MetricState, WindowStatePersistence};
use weir_error::{generic_error, ErrorContext as _, GenericError};

/// Persists window state as one JSON document per metric.
///
/// Writes go through a temporary file and a rename, so a crash mid-save
/// leaves the previous document intact.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Creates a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// If the directory cannot be created, an error is returned.
    pub fn new<P>(dir: P) -> Result<Self, GenericError>
    where
        P: Into<PathBuf>,
    {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_error_context(|| format!("failed to create state directory {}", dir.display()))?;

        Ok(Self { dir })
    }

    fn document_path(&self, metric: &str) -> PathBuf {
        self.dir.join(format!("{}.json", metric))
    }
}

impl WindowStatePersistence for FileStateStore {
    fn save_window_state(&self, state: &MetricState) -> Result<(), GenericError> {
        let path = self.document_path(&state.metric);
        let document = serde_json::to_vec(state)
            .with_error_context(|| format!("failed to serialize state for '{}'", state.metric))?;

        let staging = path.with_extension("json.tmp");
        fs::write(&staging, document)
            .with_error_context(|| format!("failed to write {}", staging.display()))?;
        fs::rename(&staging, &path)
            .with_error_context(|| format!("failed to move state into {}", path.display()))?;

        debug!(metric = %state.metric, windows = state.windows.len(), "Saved window state.");
        Ok(())
    }

    fn load_window_state(&self, metric: &str) -> Result<Option<MetricState>, GenericError> {
        let path = self.document_path(metric);
        let document = match fs::read(&path) {
            Ok(document) => document,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_error_context(|| format!("failed to read {}", path.display()))
            }
        };

        let state = serde_json::from_slice::<MetricState>(&document)
            .with_error_context(|| format!("failed to parse {}", path.display()))?;
        if state.metric != metric {
            return Err(generic_error!(
                "state document {} is for metric '{}'",
                path.display(),
                state.metric
            ));
        }

        Ok(Some(state))
    }
}

/// Lists the metrics with a saved state document under `dir`.
///
/// Used at startup to know which documents can be restored before managers
/// exist.
pub fn saved_metrics(dir: &Path) -> Result<Vec<String>, GenericError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_error_context(|| format!("failed to list {}", dir.display()))
        }
    };

    let mut metrics = Vec::new();
    for entry in entries {
        let entry = entry.with_error_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                metrics.push(stem.to_string());
            }
        }
    }

    metrics.sort();
    Ok(metrics)
}
