use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::storage::Ensemble;

/// Per-realization bundle handed to the result callback.
///
/// Cheap to clone; the ensemble accessor is shared.
#[derive(Clone)]
pub struct RunArg {
    /// Realization index within the ensemble.
    pub iens: usize,
    /// Iteration number the realization was evaluated at.
    pub itr: usize,
    /// Working directory where the forward model left its outputs.
    pub runpath: PathBuf,
    /// Storage accessor for the ensemble being evaluated.
    pub ensemble: Arc<dyn Ensemble>,
}

impl fmt::Debug for RunArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunArg")
            .field("iens", &self.iens)
            .field("itr", &self.itr)
            .field("runpath", &self.runpath)
            .finish_non_exhaustive()
    }
}
