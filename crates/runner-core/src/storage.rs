//! Ensemble storage accessors.
//!
//! The scheduler and the result callback only ever see the [`Storage`] and
//! [`Ensemble`] traits; [`MemoryStorage`] is the reference backend used by
//! the CLI and the test suites.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{ParameterConfig, ResponseConfig};

/// A loaded parameter or response dataset.
///
/// Datasets are opaque to the scheduler; a JSON value round-trips unchanged
/// between the runpath readers and the storage backend.
pub type Dataset = serde_json::Value;

/// Storage-level status of one realization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealizationState {
    /// Nothing is known about the realization.
    Undefined,
    /// Parameters exist but no responses have been loaded.
    Initialized,
    /// Responses have been loaded successfully.
    HasData,
    /// Loading results failed.
    LoadFailure,
    /// The realization failed in a prior iteration.
    ParentFailure,
}

/// Storage errors surfaced to the result callback and the run model.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A realization index outside the ensemble was addressed.
    #[error("realization index {iens} out of range for ensemble of size {size}")]
    OutOfRange {
        /// Offending realization index.
        iens: usize,
        /// Ensemble size.
        size: usize,
    },
}

/// The static part of an experiment: which datasets exist and how they are
/// read from a runpath.
pub struct Experiment {
    parameters: Vec<Arc<dyn ParameterConfig>>,
    responses: Vec<Arc<dyn ResponseConfig>>,
}

impl Experiment {
    /// Build an experiment from its parameter and response configurations.
    pub fn new(
        parameters: Vec<Arc<dyn ParameterConfig>>,
        responses: Vec<Arc<dyn ResponseConfig>>,
    ) -> Self {
        Self {
            parameters,
            responses,
        }
    }

    /// Parameter configurations, in declaration order.
    pub fn parameter_configuration(&self) -> &[Arc<dyn ParameterConfig>] {
        &self.parameters
    }

    /// Response configurations, in declaration order.
    pub fn response_configuration(&self) -> &[Arc<dyn ResponseConfig>] {
        &self.responses
    }
}

impl std::fmt::Debug for dyn Ensemble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ensemble")
            .field("ensemble_size", &self.ensemble_size())
            .field("iteration", &self.iteration())
            .finish()
    }
}

/// One ensemble's worth of storage: datasets keyed by name and realization,
/// plus the per-realization state map.
pub trait Ensemble: Send + Sync {
    /// The experiment this ensemble belongs to.
    fn experiment(&self) -> &Experiment;

    /// Number of realizations in the ensemble.
    fn ensemble_size(&self) -> usize;

    /// Iteration number this ensemble was evaluated at.
    fn iteration(&self) -> usize;

    /// Persist a parameter dataset for one realization.
    fn save_parameters(&self, name: &str, iens: usize, dataset: Dataset)
    -> Result<(), StorageError>;

    /// Persist a response dataset for one realization.
    fn save_response(&self, name: &str, dataset: Dataset, iens: usize)
    -> Result<(), StorageError>;

    /// Stored parameter dataset, if any.
    fn parameters(&self, name: &str, iens: usize) -> Option<Dataset>;

    /// Stored response dataset, if any.
    fn response(&self, name: &str, iens: usize) -> Option<Dataset>;

    /// State-map entry for `iens`; `Undefined` outside the ensemble.
    fn state(&self, iens: usize) -> RealizationState;

    /// Set the state-map entry for `iens`. Out-of-range indices are ignored.
    fn set_state(&self, iens: usize, state: RealizationState);
}

/// Factory for ensembles within one experiment.
pub trait Storage: Send + Sync {
    /// Create a fresh ensemble for `iteration` with `ensemble_size`
    /// realizations, all in state [`RealizationState::Initialized`].
    fn create_ensemble(
        &self,
        name: &str,
        iteration: usize,
        ensemble_size: usize,
    ) -> Result<Arc<dyn Ensemble>, StorageError>;
}

#[derive(Default)]
struct EnsembleData {
    state_map: Vec<RealizationState>,
    parameters: HashMap<(String, usize), Dataset>,
    responses: HashMap<(String, usize), Dataset>,
}

/// In-memory ensemble used by [`MemoryStorage`].
pub struct MemoryEnsemble {
    name: String,
    iteration: usize,
    size: usize,
    experiment: Arc<Experiment>,
    data: Mutex<EnsembleData>,
}

impl MemoryEnsemble {
    fn new(name: &str, iteration: usize, size: usize, experiment: Arc<Experiment>) -> Self {
        Self {
            name: name.to_string(),
            iteration,
            size,
            experiment,
            data: Mutex::new(EnsembleData {
                state_map: vec![RealizationState::Initialized; size],
                parameters: HashMap::new(),
                responses: HashMap::new(),
            }),
        }
    }

    /// Name the ensemble was created under.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_range(&self, iens: usize) -> Result<(), StorageError> {
        if iens >= self.size {
            return Err(StorageError::OutOfRange {
                iens,
                size: self.size,
            });
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EnsembleData> {
        self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Ensemble for MemoryEnsemble {
    fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    fn ensemble_size(&self) -> usize {
        self.size
    }

    fn iteration(&self) -> usize {
        self.iteration
    }

    fn save_parameters(
        &self,
        name: &str,
        iens: usize,
        dataset: Dataset,
    ) -> Result<(), StorageError> {
        self.check_range(iens)?;
        self.lock().parameters.insert((name.to_string(), iens), dataset);
        Ok(())
    }

    fn save_response(&self, name: &str, dataset: Dataset, iens: usize) -> Result<(), StorageError> {
        self.check_range(iens)?;
        self.lock().responses.insert((name.to_string(), iens), dataset);
        Ok(())
    }

    fn parameters(&self, name: &str, iens: usize) -> Option<Dataset> {
        self.lock().parameters.get(&(name.to_string(), iens)).cloned()
    }

    fn response(&self, name: &str, iens: usize) -> Option<Dataset> {
        self.lock().responses.get(&(name.to_string(), iens)).cloned()
    }

    fn state(&self, iens: usize) -> RealizationState {
        self.lock()
            .state_map
            .get(iens)
            .copied()
            .unwrap_or(RealizationState::Undefined)
    }

    fn set_state(&self, iens: usize, state: RealizationState) {
        if let Some(slot) = self.lock().state_map.get_mut(iens) {
            *slot = state;
        }
    }
}

/// In-memory storage backend: one experiment, any number of ensembles.
pub struct MemoryStorage {
    experiment: Arc<Experiment>,
    ensembles: Mutex<Vec<Arc<MemoryEnsemble>>>,
}

impl MemoryStorage {
    /// A storage backend for `experiment`.
    pub fn new(experiment: Experiment) -> Self {
        Self {
            experiment: Arc::new(experiment),
            ensembles: Mutex::new(Vec::new()),
        }
    }
}

impl Storage for MemoryStorage {
    fn create_ensemble(
        &self,
        name: &str,
        iteration: usize,
        ensemble_size: usize,
    ) -> Result<Arc<dyn Ensemble>, StorageError> {
        let ensemble = Arc::new(MemoryEnsemble::new(
            name,
            iteration,
            ensemble_size,
            self.experiment.clone(),
        ));
        self.ensembles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(ensemble.clone());
        Ok(ensemble)
    }
}
