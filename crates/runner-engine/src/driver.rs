//! The driver contract.
//!
//! A driver adapts one batch-scheduling backend (a local process pool, LSF,
//! PBS, SLURM) to the scheduler. Drivers are deliberately small: submit,
//! kill, and a stream of state-change events. The scheduler invokes a driver
//! only from its own task runtime, so implementations do not need internal
//! locking beyond what their own background tasks require.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Submission failure reported by a driver.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The job script could not be spawned locally.
    #[error("failed to spawn {script}: {source}")]
    Spawn {
        /// The script that was handed to the driver.
        script: String,
        /// Underlying spawn error.
        source: std::io::Error,
    },
    /// The backend rejected the submission request.
    #[error("backend rejected submission for realization {iens}: {reason}")]
    Rejected {
        /// Realization index the submission was for.
        iens: usize,
        /// Backend-provided reason.
        reason: String,
    },
}

/// State change reported by a driver for one realization.
///
/// Events for a given `iens` are totally ordered: `Started` precedes
/// `Finished`, and `Finished` is emitted at most once per submission.
/// `Aborted` acknowledges a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// The submitted job began executing.
    Started {
        /// Realization index.
        iens: usize,
    },
    /// The job finished on its own with the given exit code.
    Finished {
        /// Realization index.
        iens: usize,
        /// Process exit code.
        exit_code: i32,
    },
    /// A kill request for the realization has completed.
    Aborted {
        /// Realization index.
        iens: usize,
    },
}

impl DriverEvent {
    /// The realization this event belongs to.
    pub fn iens(&self) -> usize {
        match self {
            DriverEvent::Started { iens }
            | DriverEvent::Finished { iens, .. }
            | DriverEvent::Aborted { iens } => *iens,
        }
    }
}

/// Adaptor to a batch-scheduling backend.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Submit `job_script` for realization `iens`, to be run in `cwd`.
    ///
    /// Idempotent per `iens` within one scheduler run.
    async fn submit(&self, iens: usize, job_script: &Path, cwd: &Path) -> Result<(), SubmitError>;

    /// Ask the backend to terminate `iens`.
    ///
    /// Safe to call in any state. A kill must always be acknowledged with a
    /// [`DriverEvent::Aborted`] for `iens`, even when nothing was ever
    /// submitted; a no-op kill still acknowledges.
    async fn kill(&self, iens: usize);

    /// Begin a fresh event stream.
    ///
    /// Called once per scheduler run; events emitted before the call are
    /// dropped, and any previously returned receiver goes quiet.
    fn take_events(&self) -> mpsc::UnboundedReceiver<DriverEvent>;
}
