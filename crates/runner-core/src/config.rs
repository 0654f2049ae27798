//! Parameter and response configurations.
//!
//! A configuration describes how one named dataset is read out of a
//! realization's runpath. The scheduler never reads files itself; the result
//! callback walks the experiment's configurations and lets each one produce
//! its dataset.

use std::path::{Path, PathBuf};

use crate::storage::Dataset;

/// Error raised when a dataset cannot be read from a runpath.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The expected input file does not exist or could not be opened.
    #[error("{name}: failed to read {}: {source}", .path.display())]
    MissingFile {
        /// Configuration name.
        name: String,
        /// The file that was expected.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The input file exists but does not parse.
    #[error("{name}: invalid contents in {}: {source}", .path.display())]
    InvalidContents {
        /// Configuration name.
        name: String,
        /// The offending file.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_json::Error,
    },
    /// A summary file held none of the configured keys.
    #[error("{name}: no summary values for configured keys in {}", .path.display())]
    NoSummaryData {
        /// Configuration name.
        name: String,
        /// The summary file that was read.
        path: PathBuf,
    },
}

/// How one named parameter dataset is read from a runpath.
pub trait ParameterConfig: Send + Sync {
    /// Name the dataset is stored under.
    fn name(&self) -> &str;

    /// Whether the forward model itself produces this parameter, in which
    /// case it is read back after the first (prior) iteration.
    fn forward_init(&self) -> bool;

    /// Read the dataset for `iens` out of `runpath`.
    fn read_from_runpath(&self, runpath: &Path, iens: usize) -> Result<Dataset, ReadError>;
}

/// How one named response dataset is read from a runpath.
pub trait ResponseConfig: Send + Sync {
    /// Name the dataset is stored under.
    fn name(&self) -> &str;

    /// Summary-style configurations expose their key list; `Some` with an
    /// empty slice means there is nothing to load and the configuration is
    /// skipped entirely.
    fn summary_keys(&self) -> Option<&[String]> {
        None
    }

    /// Read the dataset for `iens` out of `runpath`.
    fn read_from_file(&self, runpath: &Path, iens: usize) -> Result<Dataset, ReadError>;
}

fn read_json(name: &str, path: &Path) -> Result<Dataset, ReadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ReadError::MissingFile {
        name: name.to_string(),
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ReadError::InvalidContents {
        name: name.to_string(),
        path: path.to_path_buf(),
        source,
    })
}

/// Parameter dataset stored as a JSON document inside the runpath.
#[derive(Debug, Clone)]
pub struct JsonParameterConfig {
    name: String,
    forward_init: bool,
    input_file: String,
}

impl JsonParameterConfig {
    /// A parameter named `name`, read from `input_file` relative to the
    /// runpath when `forward_init` is set.
    pub fn new(name: impl Into<String>, forward_init: bool, input_file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            forward_init,
            input_file: input_file.into(),
        }
    }
}

impl ParameterConfig for JsonParameterConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_init(&self) -> bool {
        self.forward_init
    }

    fn read_from_runpath(&self, runpath: &Path, _iens: usize) -> Result<Dataset, ReadError> {
        read_json(&self.name, &runpath.join(&self.input_file))
    }
}

/// Response dataset stored as a JSON document inside the runpath.
#[derive(Debug, Clone)]
pub struct JsonResponseConfig {
    name: String,
    input_file: String,
}

impl JsonResponseConfig {
    /// A response named `name`, read from `input_file` relative to the
    /// runpath.
    pub fn new(name: impl Into<String>, input_file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_file: input_file.into(),
        }
    }
}

impl ResponseConfig for JsonResponseConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_from_file(&self, runpath: &Path, _iens: usize) -> Result<Dataset, ReadError> {
        read_json(&self.name, &runpath.join(&self.input_file))
    }
}

/// Summary response: a JSON object in the runpath filtered down to a
/// configured key list.
#[derive(Debug, Clone)]
pub struct SummaryConfig {
    name: String,
    input_file: String,
    keys: Vec<String>,
}

impl SummaryConfig {
    /// A summary response named `name`, read from `input_file` and reduced to
    /// the entries listed in `keys`.
    pub fn new(
        name: impl Into<String>,
        input_file: impl Into<String>,
        keys: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            input_file: input_file.into(),
            keys,
        }
    }
}

impl ResponseConfig for SummaryConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn summary_keys(&self) -> Option<&[String]> {
        Some(&self.keys)
    }

    fn read_from_file(&self, runpath: &Path, _iens: usize) -> Result<Dataset, ReadError> {
        let path = runpath.join(&self.input_file);
        let full = read_json(&self.name, &path)?;
        let Some(object) = full.as_object() else {
            return Err(ReadError::NoSummaryData {
                name: self.name.clone(),
                path,
            });
        };

        let filtered: serde_json::Map<String, Dataset> = object
            .iter()
            .filter(|(key, _)| self.keys.iter().any(|k| k == *key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if filtered.is_empty() {
            return Err(ReadError::NoSummaryData {
                name: self.name.clone(),
                path,
            });
        }
        Ok(Dataset::Object(filtered))
    }
}
